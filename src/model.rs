use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Generation parameters as sent on the wire (and as written in the config file).
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Prompt name used in failure records that are not tied to a single prompt.
pub const ALL_PROMPTS: &str = "ALL";

/// Extra prompt text configured per model family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub append_text: Option<String>,
}

impl PromptTemplate {
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn append_text(&self) -> Option<&str> {
        self.append_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Settings resolved for one model file after applying the matching config rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    pub startup_args: Vec<String>,
    pub generation_params: Params,
    pub prompt_template: PromptTemplate,
}

#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub path: PathBuf,
    /// File name, used for display, config matching and model filters.
    pub name: String,
    /// File stem, used for output naming.
    pub stem: String,
    pub size_bytes: u64,
    pub settings: ModelSettings,
}

#[derive(Debug, Clone)]
pub struct PromptArtifact {
    pub path: PathBuf,
    pub name: String,
    pub stem: String,
}

/// Lifecycle of the single backend server owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
}

/// Result of one generate call.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub text: Option<String>,
    pub elapsed: Duration,
    pub success: bool,
    pub fallback: bool,
    pub error: Option<BenchError>,
}

impl GenerationOutcome {
    pub fn succeeded(text: String, elapsed: Duration, fallback: bool) -> Self {
        Self {
            text: Some(text),
            elapsed,
            success: true,
            fallback,
            error: None,
        }
    }

    pub fn failed(error: BenchError, elapsed: Duration, fallback: bool) -> Self {
        Self {
            text: None,
            elapsed,
            success: false,
            fallback,
            error: Some(error),
        }
    }

    /// Text worth persisting: present, successful and not blank.
    pub fn usable_text(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(e) => e.to_string(),
            None => "generation returned empty text".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub model: String,
    pub prompt: String,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(model: &str, prompt: &str, reason: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            reason: reason.into(),
        }
    }
}

/// Progress events emitted by the orchestrator and rendered by the CLI.
#[derive(Debug, Clone)]
pub enum BenchEvent {
    RunStarted {
        backend: &'static str,
        models: usize,
        prompts: usize,
    },
    ModelStarted {
        index: usize,
        total: usize,
        model: String,
    },
    ModelSkipped {
        model: String,
        existing: usize,
    },
    SessionStarting {
        command: Vec<String>,
    },
    SessionStarted {
        pid: u32,
    },
    SessionReady {
        waited: Duration,
    },
    SessionFailed {
        reason: String,
        stderr_tail: String,
    },
    SessionStopped {
        how: Option<crate::engine::Escalation>,
    },
    PromptSkipped {
        prompt: String,
    },
    PromptStarted {
        index: usize,
        total: usize,
        prompt: String,
    },
    GenerationSaved {
        prompt: String,
        elapsed: Duration,
        fallback: bool,
        path: PathBuf,
    },
    GenerationFailed {
        prompt: String,
        reason: String,
    },
    Cooldown {
        wait: Duration,
    },
    Info(InfoEvent),
    /// Last event of a run; the summary itself is what `run` returns.
    RunCompleted,
}

/// Structured info events emitted outside the main progress flow.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    Interrupted,
    ModelFiltered { model: String, reason: String },
}

impl InfoEvent {
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Interrupted => {
                "Ctrl+C detected, stopping the server and shutting down".to_string()
            }
            InfoEvent::ModelFiltered { model, reason } => {
                format!("Skipping model {model} ({reason})")
            }
        }
    }
}

/// Statistics over the elapsed time of saved generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub mean_secs: f64,
    pub median_secs: f64,
    pub p25_secs: f64,
    pub p75_secs: f64,
    pub fallbacks: usize,
}

/// End-of-run accounting. Every pair of the model x prompt matrix lands in exactly one of
/// `succeeded`, `skipped`, `failed` or `not_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp_utc: String,
    pub backend: String,
    pub models: usize,
    pub prompts: usize,
    pub total_pairs: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_run: usize,
    pub interrupted: bool,
    pub failures: Vec<FailureRecord>,
    pub timing: Option<TimingSummary>,
}
