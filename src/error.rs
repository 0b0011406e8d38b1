//! Error kinds raised by the benchmark engine.
//!
//! Per-prompt errors are recorded and the run continues; per-model errors abort the
//! current model only. Fatal run-level problems (bad config, nothing to benchmark) are
//! reported through `anyhow` at the CLI boundary instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("start command is empty")]
    EmptyCommand,

    #[error("a server process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to launch `{program}`: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server did not become ready within {}", humantime::format_duration(*.waited))]
    ReadinessTimeout { waited: Duration },

    #[error("generation request timed out after {}", humantime::format_duration(*.after))]
    GenerationTimeout { after: Duration },

    #[error("generation request failed: {0}")]
    GenerationRequest(String),

    #[error("fallback retrieval failed: {0}")]
    Fallback(String),

    #[error("unexpected response from {endpoint}: {reason}")]
    ResponseParse { endpoint: String, reason: String },

    #[error("failed to read prompt {path}: {source}")]
    PromptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    /// True for the one error kind that may be recovered through a fallback request.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BenchError::GenerationTimeout { .. })
    }
}
