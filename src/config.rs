//! Benchmark configuration.
//!
//! The JSON file is read once at startup into [`ConfigFile`], combined with CLI overrides
//! into a [`BenchConfig`] and then passed by reference to everything that needs it.

use crate::backend::{params, Backend};
use crate::engine::StopPolicy;
use crate::model::{ModelSettings, Params, PromptTemplate};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIB: f64 = (1u64 << 30) as f64;
pub const DEFAULT_CONFIG_NAME: &str = "llm-bench.json";

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub paths: PathsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backends: BTreeMap<Backend, BackendSection>,
    /// Backend-neutral parameters applied to every model before rule overrides.
    #[serde(default)]
    pub default_generation_params: Params,
    #[serde(default)]
    pub models: Vec<ModelRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub models: PathBuf,
    pub prompts: PathBuf,
    pub results: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub default_backend: Backend,
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub startup_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub primary_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub fallback_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_interrupt_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_terminate_grace: Duration,
    pub min_size_gib: Option<f64>,
    pub max_size_gib: Option<f64>,
    pub model_extension: String,
    pub prompt_extension: String,
    pub output_extension: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        let stop = StopPolicy::default();
        Self {
            default_backend: Backend::LlamaCpp,
            host: "127.0.0.1".into(),
            port: 5000,
            startup_wait: Duration::from_secs(420),
            poll_interval: Duration::from_secs(3),
            cooldown: Duration::from_secs(5),
            primary_timeout: Duration::from_secs(600),
            fallback_timeout: Duration::from_secs(10),
            stop_interrupt_grace: stop.interrupt_grace,
            stop_terminate_grace: stop.terminate_grace,
            min_size_gib: None,
            max_size_gib: None,
            model_extension: "gguf".into(),
            prompt_extension: "md".into(),
            output_extension: "md".into(),
        }
    }
}

/// How the backend executable is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchKind {
    #[default]
    Binary,
    /// A python script, started as `python3 <bin_path>`.
    Python,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub bin_path: PathBuf,
    #[serde(default)]
    pub kind: LaunchKind,
    #[serde(default)]
    pub startup_args: Vec<String>,
}

/// Resolved executable and base arguments of the selected backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendLauncher {
    pub bin_path: PathBuf,
    pub kind: LaunchKind,
    pub startup_args: Vec<String>,
}

impl BackendLauncher {
    pub fn command_prefix(&self) -> Vec<String> {
        let bin = self.bin_path.display().to_string();
        match self.kind {
            LaunchKind::Binary => vec![bin],
            LaunchKind::Python => vec!["python3".to_string(), bin],
        }
    }
}

/// Per-model overrides. The first rule whose `pattern` (and every `match_all` term)
/// occurs in the model file name wins; matching is case-insensitive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelRule {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub match_all: Vec<String>,
    #[serde(default)]
    pub startup_args: Vec<String>,
    #[serde(default)]
    pub generation_params: Params,
    #[serde(default)]
    pub prompt_template: PromptTemplate,
}

impl ModelRule {
    fn matches(&self, name_lower: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        !pattern.is_empty()
            && name_lower.contains(&pattern)
            && self
                .match_all
                .iter()
                .all(|term| name_lower.contains(&term.to_lowercase()))
    }
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend: Option<Backend>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub startup_wait: Option<Duration>,
    pub cooldown: Option<Duration>,
    pub primary_timeout: Option<Duration>,
    pub fallback_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub backend: Backend,
    pub launcher: BackendLauncher,
    pub host: String,
    pub port: u16,
    pub models_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub results_dir: PathBuf,
    pub startup_wait: Duration,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub primary_timeout: Duration,
    pub fallback_timeout: Duration,
    pub stop_policy: StopPolicy,
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub model_extension: String,
    pub prompt_extension: String,
    pub output_extension: String,
    pub default_generation_params: Params,
    pub model_rules: Vec<ModelRule>,
}

impl BenchConfig {
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> Result<Self> {
        let server = file.server;
        let backend = overrides.backend.unwrap_or(server.default_backend);
        let section = file
            .backends
            .get(&backend)
            .ok_or_else(|| {
                let known: Vec<&str> = Backend::ALL.iter().map(|b| b.name()).collect();
                anyhow!(
                    "backend '{backend}' is not defined in the config file (supported: {})",
                    known.join(", ")
                )
            })?;

        let mut default_generation_params = params::common_generation_params();
        params::merge(&mut default_generation_params, file.default_generation_params);

        let min_size_bytes = server.min_size_gib.map(gib_to_bytes);
        let max_size_bytes = server.max_size_gib.map(gib_to_bytes);
        if let (Some(min), Some(max)) = (min_size_bytes, max_size_bytes) {
            if min > max {
                bail!("min_size_gib is larger than max_size_gib");
            }
        }

        Ok(Self {
            backend,
            launcher: BackendLauncher {
                bin_path: expand_home(&section.bin_path),
                kind: section.kind,
                startup_args: section.startup_args.clone(),
            },
            host: overrides.host.clone().unwrap_or(server.host),
            port: overrides.port.unwrap_or(server.port),
            models_dir: expand_home(&file.paths.models),
            prompts_dir: expand_home(&file.paths.prompts),
            results_dir: expand_home(&file.paths.results),
            startup_wait: overrides.startup_wait.unwrap_or(server.startup_wait),
            poll_interval: server.poll_interval,
            cooldown: overrides.cooldown.unwrap_or(server.cooldown),
            primary_timeout: overrides.primary_timeout.unwrap_or(server.primary_timeout),
            fallback_timeout: overrides.fallback_timeout.unwrap_or(server.fallback_timeout),
            stop_policy: StopPolicy {
                interrupt_grace: server.stop_interrupt_grace,
                terminate_grace: server.stop_terminate_grace,
            },
            min_size_bytes,
            max_size_bytes,
            model_extension: server.model_extension,
            prompt_extension: server.prompt_extension,
            output_extension: server.output_extension,
            default_generation_params,
            model_rules: file.models,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Startup args, generation params and template for `model_file_name`.
    pub fn model_settings(&self, model_file_name: &str) -> ModelSettings {
        let lower = model_file_name.to_lowercase();
        let mut generation_params = self.default_generation_params.clone();
        match self.model_rules.iter().find(|r| r.matches(&lower)) {
            Some(rule) => {
                params::merge(&mut generation_params, rule.generation_params.clone());
                ModelSettings {
                    startup_args: rule.startup_args.clone(),
                    generation_params,
                    prompt_template: rule.prompt_template.clone(),
                }
            }
            None => ModelSettings {
                generation_params,
                ..ModelSettings::default()
            },
        }
    }
}

fn gib_to_bytes(gib: f64) -> u64 {
    (gib * GIB) as u64
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Locate the config file: the explicit path, `./llm-bench.json`, then the per-user
/// config directory.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        if p.is_file() {
            return Ok(p.to_path_buf());
        }
        bail!("config file not found: {}", p.display());
    }
    let local = PathBuf::from(DEFAULT_CONFIG_NAME);
    if local.is_file() {
        return Ok(local);
    }
    if let Some(dir) = dirs::config_dir() {
        let user = dir.join("llm-bench").join("config.json");
        if user.is_file() {
            return Ok(user);
        }
    }
    bail!("config file not found (pass --config or create ./{DEFAULT_CONFIG_NAME})")
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "paths": {"models": "/data/models", "prompts": "/data/prompts", "results": "/data/results"},
        "server": {
            "default_backend": "koboldcpp",
            "port": 5001,
            "startup_wait": "2m",
            "cooldown": "1s",
            "max_size_gib": 31,
            "min_size_gib": 1
        },
        "backends": {
            "koboldcpp": {"bin_path": "/opt/koboldcpp.py", "kind": "python", "startup_args": ["--usecublas", "normal"]},
            "llamacpp": {"bin_path": "/opt/llama-server"}
        },
        "default_generation_params": {"temperature": 0.6, "max_tokens": 8192},
        "models": [
            {"pattern": "qwen", "match_all": ["coder"], "startup_args": ["--ctx-size", "32768"],
             "generation_params": {"temperature": 0.2}},
            {"pattern": "qwen", "generation_params": {"top_p": 0.8},
             "prompt_template": {"system_prompt": "You are Qwen."}}
        ]
    }"#;

    fn sample() -> ConfigFile {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn resolves_file_values_and_defaults() {
        let cfg = BenchConfig::resolve(sample(), &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.backend, Backend::Kobold);
        assert_eq!(cfg.launcher.kind, LaunchKind::Python);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 5001);
        assert_eq!(cfg.startup_wait, Duration::from_secs(120));
        assert_eq!(cfg.primary_timeout, Duration::from_secs(600));
        assert_eq!(cfg.fallback_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_size_bytes, Some(31 * (1u64 << 30)));
        assert_eq!(cfg.min_size_bytes, Some(1u64 << 30));
        assert_eq!(cfg.base_url(), "http://127.0.0.1:5001");
        assert_eq!(cfg.stop_policy, StopPolicy::default());
    }

    #[test]
    fn cli_overrides_win() {
        let overrides = ConfigOverrides {
            backend: Some(Backend::LlamaCpp),
            port: Some(8080),
            primary_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let cfg = BenchConfig::resolve(sample(), &overrides).unwrap();
        assert_eq!(cfg.backend, Backend::LlamaCpp);
        assert_eq!(cfg.launcher.command_prefix(), vec!["/opt/llama-server"]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.primary_timeout, Duration::from_secs(30));
    }

    #[test]
    fn undefined_backend_is_an_error() {
        let mut file = sample();
        file.backends.remove(&Backend::LlamaCpp);
        let overrides = ConfigOverrides {
            backend: Some(Backend::LlamaCpp),
            ..Default::default()
        };
        let err = BenchConfig::resolve(file, &overrides).unwrap_err();
        assert!(err.to_string().contains("llamacpp"));
    }

    #[test]
    fn first_matching_rule_wins_and_merges_params() {
        let cfg = BenchConfig::resolve(sample(), &ConfigOverrides::default()).unwrap();

        let coder = cfg.model_settings("Qwen2.5-Coder-32B-Q4_K_M.gguf");
        assert_eq!(coder.startup_args, vec!["--ctx-size", "32768"]);
        assert_eq!(coder.generation_params["temperature"], json!(0.2));
        assert_eq!(coder.generation_params["max_tokens"], json!(8192));
        assert_eq!(coder.prompt_template, PromptTemplate::default());

        let chat = cfg.model_settings("qwen2.5-72b-instruct.gguf");
        assert!(chat.startup_args.is_empty());
        assert_eq!(chat.generation_params["temperature"], json!(0.6));
        assert_eq!(chat.generation_params["top_p"], json!(0.8));
        assert_eq!(chat.prompt_template.system_prompt(), Some("You are Qwen."));

        let other = cfg.model_settings("gemma-3-27b.gguf");
        assert!(other.startup_args.is_empty());
        assert_eq!(other.generation_params["top_k"], json!(64));
    }

    #[test]
    fn inverted_size_bounds_are_rejected() {
        let mut file = sample();
        file.server.min_size_gib = Some(40.0);
        assert!(BenchConfig::resolve(file, &ConfigOverrides::default()).is_err());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(find_config_path(Some(&missing)).is_err());

        let present = dir.path().join("cfg.json");
        std::fs::write(&present, SAMPLE).unwrap();
        assert_eq!(find_config_path(Some(&present)).unwrap(), present);
        assert!(load_config_file(&present).is_ok());
    }

    #[test]
    fn home_prefix_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/models")), home.join("models"));
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
