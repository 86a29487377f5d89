use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentErr>;

#[derive(Error, Debug)]
pub enum AgentErr {
    /// Network, auth, quota or timeout failure from the model provider. The
    /// turn terminates and memory is not updated with a fabricated answer.
    #[error("provider error: {0}")]
    Provider(String),

    /// The stream disconnected or timed out after the HTTP handshake
    /// succeeded. Retried by the stream recovery wrapper; optionally carries
    /// a requested delay before the next attempt.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// Strict parse, lenient repair and the streaming snapshot all came up
    /// empty.
    #[error("model response could not be parsed")]
    ParseFailure,

    #[error(transparent)]
    Apply(#[from] pilot_apply::ApplyError),

    /// The access policy rejected a read or write.
    #[error("file access denied by session policy: {}", path.display())]
    AccessDenied { path: PathBuf },

    #[error("command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    /// The lint loop guard fired and the one-shot recovery pass also failed.
    #[error("lint cycle limit reached without concrete edits")]
    LintLoopExceeded,

    #[error("interrupted (Ctrl-C)")]
    Interrupted,

    #[error("no provider named `{0}` is configured")]
    UnknownProvider(String),

    #[error("missing API key for provider `{0}`")]
    MissingApiKey(String),

    #[error("session `{0}` does not exist")]
    SessionNotFound(String),

    #[error("{0}")]
    Config(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl AgentErr {
    /// One-line remediation hint shown next to the error panel.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            AgentErr::Provider(_) | AgentErr::Stream(..) => {
                Some("check the provider endpoint or switch providers with /config")
            }
            AgentErr::MissingApiKey(_) => Some("set the provider API key with /config"),
            AgentErr::AccessDenied { .. } => Some("grant file access with /access"),
            AgentErr::LintLoopExceeded => Some("re-run with a narrower instruction"),
            _ => None,
        }
    }
}
