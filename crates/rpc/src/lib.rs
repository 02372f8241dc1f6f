//! Authenticated request/response transport between neurons.
//!
//! Every request is a signed envelope carried over HTTP `POST /rpc`. The
//! server authenticates the sender against the current network snapshot,
//! applies admission policy and dispatches to the handler registered for the
//! request kind; responses are signed by the responder and bound to the
//! request digest.

pub mod client;
pub mod handler;
pub mod nonce;
pub mod pipeline;
pub mod retry;
pub mod server;

pub use client::{ClientConfig, ClientError, TransportClient};
pub use handler::{
    handler_fn, HandlerError, HandlerRegistry, RegistrationError, RequestContext, RequestHandler,
};
pub use nonce::NonceSource;
pub use pipeline::{
    CommandConfig, CommandPipeline, OptimizationError, OptimizationPipeline, PipelineHandler,
    SubmissionHandler,
};
pub use retry::RetryPolicy;
pub use server::{bind_listener, ServerConfig, TransportServer};
