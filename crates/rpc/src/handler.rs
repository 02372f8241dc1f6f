use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use neuron_types::{ErrorCode, PeerIndex, PublicKey, RequestKind};
use thiserror::Error;

/// Authenticated facts about the request being handled.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub sender: PublicKey,
    pub sender_index: PeerIndex,
    pub kind: RequestKind,
    pub nonce: u64,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    BadPayload(String),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
}

impl HandlerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::BadPayload(_) => ErrorCode::Malformed,
            HandlerError::Failed(_) => ErrorCode::HandlerFailed,
            HandlerError::Unavailable(_) => ErrorCode::Unavailable,
        }
    }
}

/// Serves one request kind. Invoked on its own task; the future is dropped if
/// the server's handler timeout elapses.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("a handler is already registered for request kind {0}")]
    Duplicate(RequestKind),
}

/// Explicit mapping from request kind to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestKind, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: RequestKind,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), RegistrationError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistrationError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &RequestKind) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&RequestKind> {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
        (self.0)(ctx, payload).await
    }
}
