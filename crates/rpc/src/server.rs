use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use neuron_crypto::{verify_signature, Keystore};
use neuron_network::SnapshotMirror;
use neuron_security::{AdmissionError, AdmissionGuard};
use neuron_types::{
    short_key, unix_millis, Digest, ErrorBody, ErrorCode, MessageHeader, PeerIndex,
    RequestKind, ResponseOutcome, SignedRequest, SignedResponse,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::handler::{HandlerRegistry, RegistrationError, RequestContext, RequestHandler};
use crate::nonce::NonceSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Upper bound on a single handler invocation
    pub handler_timeout_ms: u64,
    pub max_body_bytes: usize,
    /// Requests processed concurrently across all connections
    pub max_in_flight: usize,
    /// Senders staking less than this are refused
    pub min_stake: u64,
    /// Refuse every request while the network snapshot is stale
    pub reject_when_stale: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8091".to_string(),
            handler_timeout_ms: 30_000,
            max_body_bytes: 1024 * 1024, // 1MB
            max_in_flight: 256,
            min_stake: 0,
            reject_when_stale: false,
        }
    }
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

struct AppState {
    keystore: Arc<Keystore>,
    mirror: Arc<SnapshotMirror>,
    guard: Arc<AdmissionGuard>,
    registry: HandlerRegistry,
    config: ServerConfig,
    nonces: NonceSource,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
    req_count: AtomicU64,
}

impl AppState {
    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

type SharedState = Arc<AppState>;

/// Inbound side of the transport: authenticates, admits and dispatches
/// signed requests to registered handlers.
pub struct TransportServer {
    keystore: Arc<Keystore>,
    mirror: Arc<SnapshotMirror>,
    guard: Arc<AdmissionGuard>,
    registry: HandlerRegistry,
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
}

impl TransportServer {
    pub fn new(
        keystore: Arc<Keystore>,
        mirror: Arc<SnapshotMirror>,
        guard: Arc<AdmissionGuard>,
        config: ServerConfig,
    ) -> Self {
        Self {
            keystore,
            mirror,
            guard,
            registry: HandlerRegistry::new(),
            config,
            metrics: None,
        }
    }

    /// Expose the Prometheus registry on `GET /metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn register_handler(
        &mut self,
        kind: RequestKind,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), RegistrationError> {
        info!(kind = %kind, "registered request handler");
        self.registry.register(kind, handler)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(self) -> Router {
        let max_body_bytes = self.config.max_body_bytes;
        let max_in_flight = self.config.max_in_flight.max(1);
        let state = Arc::new(AppState {
            keystore: self.keystore,
            mirror: self.mirror,
            guard: self.guard,
            registry: self.registry,
            config: self.config,
            nonces: NonceSource::new(),
            metrics: self.metrics,
            start_time: Instant::now(),
            req_count: AtomicU64::new(0),
        });

        Router::new()
            .route("/rpc", post(handle_rpc))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = Arc::clone(&self.guard);
        let housekeeping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                guard.cleanup();
            }
        });

        let local_addr = listener.local_addr().ok();
        info!(addr = ?local_addr, "RPC server listening");
        let app = self.router();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("RPC server terminated unexpectedly");

        housekeeping.abort();
        info!("RPC server stopped");
        result
    }
}

pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Failures that cannot be expressed as a signed response.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

fn status_for(outcome: &ResponseOutcome) -> StatusCode {
    match outcome {
        ResponseOutcome::Ok { .. } => StatusCode::OK,
        ResponseOutcome::Error(body) => match body.code {
            ErrorCode::Authentication => StatusCode::UNAUTHORIZED,
            ErrorCode::Replay => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UnknownKind => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::HandlerFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Malformed => StatusCode::BAD_REQUEST,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

fn admission_body(err: AdmissionError) -> ErrorBody {
    match &err {
        AdmissionError::Replay(_) => ErrorBody::new(ErrorCode::Replay, err.to_string()),
        AdmissionError::RateLimited { retry_after, .. } => {
            let retry_after_ms = retry_after.as_millis().max(1) as u64;
            ErrorBody::new(ErrorCode::RateLimited, err.to_string()).with_retry_after(retry_after_ms)
        }
    }
}

async fn handle_rpc(
    State(state): State<SharedState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.record_request();
    let remote_ip = connect_info.map(|ConnectInfo(addr)| addr.ip());

    let request: SignedRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("malformed request envelope: {err}")))?;

    let kind = request.kind.clone();
    let in_reply_to = request.digest();
    let started = Instant::now();
    let outcome = process(&state, remote_ip, request).await;
    let code = match &outcome {
        ResponseOutcome::Ok { .. } => "ok",
        ResponseOutcome::Error(body) => body.code.as_str(),
    };
    counter!("neuron_rpc_requests_total", "kind" => kind.to_string(), "outcome" => code)
        .increment(1);
    histogram!("neuron_rpc_request_seconds", "kind" => kind.to_string())
        .record(started.elapsed().as_secs_f64());

    let response = sign_response(&state, in_reply_to, outcome)?;
    let status = status_for(&response.outcome);
    let retry_after = match &response.outcome {
        ResponseOutcome::Error(ErrorBody {
            retry_after_ms: Some(ms),
            ..
        }) => Some(ms.div_ceil(1000).max(1)),
        _ => None,
    };

    let mut http_response = (status, Json(response)).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            http_response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    Ok(http_response)
}

fn sign_response(
    state: &AppState,
    in_reply_to: Digest,
    outcome: ResponseOutcome,
) -> Result<SignedResponse, ApiError> {
    let signer = state.keystore.signer().map_err(|err| {
        warn!(error = %err, "cannot sign RPC response");
        ApiError::service_unavailable("signing key unavailable")
    })?;
    let header = MessageHeader {
        sender: signer.public_key(),
        nonce: state.nonces.next(),
        timestamp_ms: unix_millis(),
    };
    let signature = signer
        .sign(&SignedResponse::signing_bytes(&header, &in_reply_to, &outcome))
        .map_err(|err| {
            warn!(error = %err, "cannot sign RPC response");
            ApiError::service_unavailable("signing key unavailable")
        })?;
    Ok(SignedResponse {
        header,
        in_reply_to,
        outcome,
        signature,
    })
}

/// Authenticate, admit and dispatch one request.
async fn process(
    state: &AppState,
    remote_ip: Option<IpAddr>,
    request: SignedRequest,
) -> ResponseOutcome {
    let sender = request.header.sender;

    if let Err(err) = state.guard.check_ip(remote_ip) {
        return ResponseOutcome::Error(admission_body(err));
    }

    // 1. authentication against the current snapshot
    let sender_index = match authenticate(state, &request) {
        Ok(index) => {
            state.guard.record_auth_success(remote_ip);
            index
        }
        Err(reason) => {
            debug!(sender = %short_key(&sender), ip = ?remote_ip, reason, "authentication failed");
            state.guard.record_auth_failure(remote_ip);
            return ResponseOutcome::Error(ErrorBody::new(ErrorCode::Authentication, reason));
        }
    };

    // 2. nonce freshness, 3. rate policy
    if let Err(err) = state.guard.check_replay(
        &sender,
        request.header.nonce,
        request.header.timestamp_ms,
        unix_millis(),
    ) {
        return ResponseOutcome::Error(admission_body(err));
    }
    if let Err(err) = state.guard.check_rate(&sender, request.kind.as_str()) {
        return ResponseOutcome::Error(admission_body(err));
    }

    // 4. dispatch under a bounded timeout
    let Some(handler) = state.registry.get(&request.kind) else {
        return ResponseOutcome::Error(ErrorBody::new(
            ErrorCode::UnknownKind,
            format!("no handler for request kind {}", request.kind),
        ));
    };

    let ctx = RequestContext {
        sender,
        sender_index,
        kind: request.kind.clone(),
        nonce: request.header.nonce,
    };
    dispatch(state, handler, ctx, request.payload).await
}

fn authenticate(state: &AppState, request: &SignedRequest) -> Result<PeerIndex, &'static str> {
    if state.config.reject_when_stale && state.mirror.is_stale() {
        return Err("network snapshot is stale");
    }
    let snapshot = state.mirror.current_snapshot();
    let peer = snapshot
        .by_key(&request.header.sender)
        .ok_or("sender is not registered")?;
    if peer.stake < state.config.min_stake {
        return Err("sender stake below minimum");
    }
    verify_signature(&request.header.sender, &request.message(), &request.signature)
        .map_err(|_| "signature does not verify")?;
    Ok(peer.index)
}

async fn dispatch(
    state: &AppState,
    handler: Arc<dyn RequestHandler>,
    ctx: RequestContext,
    payload: Vec<u8>,
) -> ResponseOutcome {
    let kind = ctx.kind.clone();
    let sender = ctx.sender;
    let timeout = state.config.handler_timeout();
    let started = Instant::now();

    let mut task = tokio::spawn(async move { handler.handle(ctx, payload).await });
    let result = tokio::time::timeout(timeout, &mut task).await;
    histogram!("neuron_rpc_handler_seconds", "kind" => kind.to_string())
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(Ok(payload))) => ResponseOutcome::Ok { payload },
        Ok(Ok(Err(err))) => {
            debug!(kind = %kind, sender = %short_key(&sender), error = %err, "handler returned error");
            ResponseOutcome::Error(ErrorBody::new(err.code(), err.to_string()))
        }
        Ok(Err(join_err)) => {
            warn!(kind = %kind, sender = %short_key(&sender), error = %join_err, "handler task failed");
            ResponseOutcome::Error(ErrorBody::new(
                ErrorCode::HandlerFailed,
                "handler terminated unexpectedly",
            ))
        }
        Err(_) => {
            // dropping the handler future cancels the work it drives
            task.abort();
            warn!(
                kind = %kind,
                sender = %short_key(&sender),
                timeout_ms = timeout.as_millis() as u64,
                "handler timed out"
            );
            ResponseOutcome::Error(ErrorBody::new(
                ErrorCode::Timeout,
                format!("handler exceeded {}ms", timeout.as_millis()),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    public_key: Option<String>,
    registered_index: Option<PeerIndex>,
    block: u64,
    peer_count: usize,
    snapshot_age_ms: Option<u64>,
    stale: bool,
    handlers: Vec<String>,
    uptime_secs: u64,
    req_total: u64,
    version: &'static str,
    commit: Option<&'static str>,
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    let status = state.mirror.status();
    Json(HealthResponse {
        status: if status.stale { "degraded" } else { "ok" },
        public_key: state.keystore.public_identifier().ok().map(hex::encode),
        registered_index: state.keystore.registered_index(),
        block: status.snapshot.block(),
        peer_count: status.snapshot.len(),
        snapshot_age_ms: status.age.map(|age| age.as_millis() as u64),
        stale: status.stale,
        handlers: state
            .registry
            .kinds()
            .into_iter()
            .map(|kind| kind.to_string())
            .collect(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        req_total,
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_HASH"),
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state.record_request();
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "metrics exporter disabled"))?;
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}
