//! Seam between the transport and a miner's optimization pipeline.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use neuron_types::{short_key, CheckpointSubmission};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::handler::{HandlerError, RequestContext, RequestHandler};

#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("pipeline rejected input: {0}")]
    InvalidInput(String),

    #[error("pipeline failed to start: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("pipeline I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
}

/// Opaque, potentially slow transformation of a request payload.
///
/// Implementations must tolerate being dropped mid-call; the server cancels
/// pipelines that exceed the handler timeout.
#[async_trait]
pub trait OptimizationPipeline: Send + Sync + 'static {
    async fn optimize(&self, payload: Vec<u8>) -> Result<Vec<u8>, OptimizationError>;
}

/// Serves a pipeline as a request handler.
pub struct PipelineHandler<P> {
    pipeline: P,
}

impl<P: OptimizationPipeline> PipelineHandler<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl<P: OptimizationPipeline> RequestHandler for PipelineHandler<P> {
    async fn handle(&self, ctx: RequestContext, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
        debug!(
            sender = %short_key(&ctx.sender),
            bytes = payload.len(),
            "running optimization pipeline"
        );
        self.pipeline.optimize(payload).await.map_err(|err| match err {
            OptimizationError::InvalidInput(reason) => HandlerError::BadPayload(reason),
            OptimizationError::Spawn(err) => HandlerError::Unavailable(err.to_string()),
            other => HandlerError::Failed(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Runs an external program per request: the payload goes to stdin and
/// stdout is the response. Exit status 2 means the input was rejected.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    config: CommandConfig,
}

const INVALID_INPUT_EXIT: i32 = 2;

impl CommandPipeline {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl OptimizationPipeline for CommandPipeline {
    async fn optimize(&self, payload: Vec<u8>) -> Result<Vec<u8>, OptimizationError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(OptimizationError::Spawn)?;
        // stdin is fed while stdout drains, or a streaming child blocks on a
        // full pipe before we finish writing.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Ok(()) => {}
            // the child exited without reading everything; its status decides
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.config.program.display(), "pipeline closed stdin early");
            }
            Err(err) => return Err(err.into()),
        }

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(INVALID_INPUT_EXIT) => Err(OptimizationError::InvalidInput(stderr)),
            code => {
                warn!(program = %self.config.program.display(), ?code, "pipeline exited with failure");
                Err(OptimizationError::Exited { code, stderr })
            }
        }
    }
}

/// Serves the miner's current checkpoint submission in its compact encoding.
#[derive(Clone, Default)]
pub struct SubmissionHandler {
    current: Arc<RwLock<Option<CheckpointSubmission>>>,
}

impl SubmissionHandler {
    pub fn new(submission: Option<CheckpointSubmission>) -> Self {
        Self {
            current: Arc::new(RwLock::new(submission)),
        }
    }

    pub fn update(&self, submission: CheckpointSubmission) {
        *self.current.write() = Some(submission);
    }

    pub fn current(&self) -> Option<CheckpointSubmission> {
        self.current.read().clone()
    }
}

#[async_trait]
impl RequestHandler for SubmissionHandler {
    async fn handle(&self, _ctx: RequestContext, _payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
        let submission = self
            .current()
            .ok_or_else(|| HandlerError::Unavailable("no checkpoint submitted yet".into()))?;
        submission
            .to_bytes()
            .map_err(|err| HandlerError::Failed(err.to_string()))
    }
}
