//! Runtime pieces the orchestrator drives: the server process, the readiness wait and the
//! generation requests.

mod dispatch;
mod readiness;
mod supervisor;

pub use dispatch::{GenerationDispatcher, GenerationRequest};
pub(crate) use readiness::wait_until_ready;
pub use supervisor::{Escalation, ProcessSupervisor, StopPolicy};

use anyhow::{Context, Result};

/// HTTP client shared by readiness probes and generation requests. Timeouts are set per
/// request since probes and generations need very different bounds.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("llm-bench/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to create HTTP client")
}
