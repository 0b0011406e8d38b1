//! Backend adapters.
//!
//! Each supported inference server is one variant of [`Backend`]. A variant knows how to
//! launch its server, how to tell that it finished loading a model, how its request body
//! looks and where the generated text sits in the response. The generic request flow
//! (timeouts, fallback retrieval) lives in [`crate::engine::GenerationDispatcher`].
//!
//! Adding a backend means adding a variant, a module with its specifics and an entry in
//! [`Backend::ALL`].

mod filters;
mod kobold;
mod llama_cpp;
pub mod params;

use crate::config::BackendLauncher;
use crate::model::{Params, PromptTemplate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Upper bound for a single readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Backend {
    #[serde(rename = "koboldcpp")]
    #[value(name = "koboldcpp")]
    Kobold,
    #[serde(rename = "llamacpp")]
    #[value(name = "llamacpp")]
    LlamaCpp,
}

/// Secondary request used to recover the result of a timed-out generation.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackRequest {
    pub endpoint: &'static str,
    pub payload: Value,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Kobold, Backend::LlamaCpp];

    /// Stable identifier used in logs, config keys and output metadata.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Kobold => "koboldcpp",
            Backend::LlamaCpp => "llamacpp",
        }
    }

    /// Flags the server needs, with the value used when neither the base nor the
    /// model-specific arguments set them. The first spelling is the one we add.
    fn required_flags(self) -> &'static [(&'static [&'static str], &'static str)] {
        match self {
            Backend::Kobold => kobold::REQUIRED_FLAGS,
            Backend::LlamaCpp => llama_cpp::REQUIRED_FLAGS,
        }
    }

    fn model_flag(self) -> &'static str {
        match self {
            Backend::Kobold => "--model",
            Backend::LlamaCpp => "-m",
        }
    }

    /// Full argument vector (program first) for launching a server on `host:port`.
    ///
    /// Order: launcher prefix, base startup args, missing required flags, model flag,
    /// host/port, then model-specific args so they win over everything before them.
    pub fn build_start_command(
        self,
        launcher: &BackendLauncher,
        model_path: &Path,
        model_args: &[String],
        host: &str,
        port: u16,
    ) -> Vec<String> {
        let mut cmd = launcher.command_prefix();
        cmd.extend(launcher.startup_args.iter().cloned());

        for (spellings, default) in self.required_flags() {
            let present = launcher
                .startup_args
                .iter()
                .chain(model_args)
                .any(|arg| has_flag(arg, spellings));
            if !present {
                cmd.push(spellings[0].to_string());
                cmd.push(default.to_string());
            }
        }

        cmd.push(self.model_flag().to_string());
        cmd.push(model_path.display().to_string());
        cmd.extend([
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);
        cmd.extend(model_args.iter().cloned());
        cmd
    }

    fn health_path(self) -> &'static str {
        match self {
            Backend::Kobold => kobold::MODEL_PATH,
            Backend::LlamaCpp => llama_cpp::HEALTH_PATH,
        }
    }

    /// One short health probe. Network and parse errors count as "not ready".
    pub async fn is_ready(self, http: &reqwest::Client, base_url: &str) -> bool {
        let url = format!("{}{}", base_url.trim_end_matches('/'), self.health_path());
        let resp = match http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::trace!(%url, error = %e, "readiness probe failed");
                return false;
            }
        };
        if !resp.status().is_success() {
            return false;
        }
        let Ok(body) = resp.json::<Value>().await else {
            return false;
        };
        match self {
            Backend::Kobold => kobold::reports_ready(&body),
            Backend::LlamaCpp => llama_cpp::reports_ready(&body),
        }
    }

    /// Baseline request fields, derived from the common parameter set.
    pub fn default_generation_params(self) -> Params {
        match self {
            Backend::Kobold => kobold::default_params(),
            Backend::LlamaCpp => llama_cpp::default_params(),
        }
    }

    /// Translate backend-neutral parameter names into this backend's field names.
    pub fn map_params(self, generic: &Params) -> Params {
        match self {
            Backend::Kobold => kobold::map_params(generic),
            Backend::LlamaCpp => llama_cpp::map_params(generic),
        }
    }

    pub fn apply_prompt_filter(self, model_name: &str, prompt: String) -> String {
        filters::apply_prompt_rules(filters::PROMPT_RULES, model_name, prompt)
    }

    /// Put the prompt into the request body in the shape this backend expects.
    pub fn apply_template(self, payload: &mut Params, prompt: String, template: &PromptTemplate) {
        match self {
            Backend::Kobold => kobold::apply_template(payload, prompt, template),
            Backend::LlamaCpp => llama_cpp::apply_template(payload, prompt, template),
        }
    }

    pub fn apply_payload_filter(self, model_name: &str, payload: &mut Params) -> Vec<&'static str> {
        let rules = match self {
            Backend::Kobold => kobold::PAYLOAD_RULES,
            Backend::LlamaCpp => llama_cpp::PAYLOAD_RULES,
        };
        filters::apply_payload_rules(rules, model_name, payload)
    }

    /// Tag the request so a later fallback call can find it. Returns the fallback request
    /// for backends that support result retrieval.
    pub fn attach_request_key(self, model_name: &str, payload: &mut Params) -> Option<FallbackRequest> {
        match self {
            Backend::Kobold => Some(kobold::attach_generation_key(model_name, payload)),
            Backend::LlamaCpp => None,
        }
    }

    pub fn generate_path(self) -> &'static str {
        match self {
            Backend::Kobold => kobold::GENERATE_PATH,
            Backend::LlamaCpp => llama_cpp::GENERATE_PATH,
        }
    }

    /// Pull the generated text out of a response body (primary or fallback).
    pub fn extract_text(self, body: &Value) -> Result<String, String> {
        let (pointer, label) = match self {
            Backend::Kobold => ("/results/0/text", "results[0].text"),
            Backend::LlamaCpp => ("/choices/0/message/content", "choices[0].message.content"),
        };
        match body.pointer(pointer) {
            Some(Value::String(s)) => Ok(s.trim().to_string()),
            Some(_) => Err(format!("'{label}' is not a string")),
            None => Err(format!("'{label}' not found")),
        }
    }
}

fn has_flag(arg: &str, spellings: &[&str]) -> bool {
    spellings.iter().any(|flag| {
        arg == *flag
            || arg
                .strip_prefix(*flag)
                .is_some_and(|rest| rest.starts_with('='))
    })
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
