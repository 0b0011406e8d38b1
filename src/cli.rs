use crate::backend::Backend;
use crate::config::{self, BenchConfig, ConfigOverrides};
use crate::engine::{self, Escalation};
use crate::model::{BenchEvent, RunSummary};
use crate::orchestrator::{self, ResultStore, RunOrchestrator};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "llm-bench",
    version,
    about = "Run every prompt against every local model on a llama.cpp or KoboldCpp server"
)]
pub struct Cli {
    /// Config file (default: ./llm-bench.json, then the user config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backend to launch, overriding the config's default_backend
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Host the server binds to and is queried on
    #[arg(long)]
    pub host: Option<String>,

    /// Port the server binds to and is queried on
    #[arg(long)]
    pub port: Option<u16>,

    /// How long to wait for a server to load its model
    #[arg(long)]
    pub startup_wait: Option<humantime::Duration>,

    /// Pause between stopping one server and starting the next
    #[arg(long)]
    pub cooldown: Option<humantime::Duration>,

    /// Timeout of the primary generation request
    #[arg(long)]
    pub primary_timeout: Option<humantime::Duration>,

    /// Timeout of the fallback retrieval request
    #[arg(long)]
    pub fallback_timeout: Option<humantime::Duration>,

    /// Print the summary as JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// List the planned model x prompt matrix and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// How a run ended, for the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Interrupted,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            backend: self.backend,
            host: self.host.clone(),
            port: self.port,
            startup_wait: self.startup_wait.map(Duration::from),
            cooldown: self.cooldown.map(Duration::from),
            primary_timeout: self.primary_timeout.map(Duration::from),
            fallback_timeout: self.fallback_timeout.map(Duration::from),
        }
    }
}

/// Load the config file and apply command-line overrides.
pub fn build_config(args: &Cli) -> Result<BenchConfig> {
    let path = config::find_config_path(args.config.as_deref())?;
    let file = config::load_config_file(&path)?;
    BenchConfig::resolve(file, &args.overrides())
        .with_context(|| format!("invalid config {}", path.display()))
}

pub async fn run(args: Cli) -> Result<RunStatus> {
    let cfg = build_config(&args)?;
    let plan = orchestrator::plan_run(&cfg)?;
    let (out_tx, out_handle) = spawn_output_writer();

    if args.dry_run {
        let store = ResultStore::new(&cfg.results_dir, &cfg.output_extension);
        for line in crate::text_summary::build_plan_lines(&plan, &store) {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        drop(out_tx);
        let _ = out_handle.await;
        return Ok(RunStatus::Completed);
    }

    let http = engine::build_http_client()?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<BenchEvent>();
    let orchestrator = RunOrchestrator::new(&cfg, http, evt_tx);

    // The orchestrator borrows the config, so it runs alongside the event loop on this
    // task rather than on a spawned one. The loop ends when the orchestrator drops its sender.
    let quiet = args.json;
    let render = async {
        while let Some(ev) = evt_rx.recv().await {
            for line in render_event(&ev, quiet) {
                let _ = out_tx.send(line);
            }
        }
    };
    let (result, ()) = tokio::join!(orchestrator.run(&plan), render);
    let summary = result.context("benchmark run failed")?;

    print_summary(&summary, args.json, &out_tx)?;
    drop(out_tx);
    let _ = out_handle.await;

    Ok(if summary.interrupted {
        RunStatus::Interrupted
    } else {
        RunStatus::Completed
    })
}

fn print_summary(
    summary: &RunSummary,
    json: bool,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

/// Progress lines for one event. With `quiet` only problems are reported.
fn render_event(ev: &BenchEvent, quiet: bool) -> Vec<OutputLine> {
    let mut lines = Vec::new();
    let mut err = |msg: String| lines.push(OutputLine::Stderr(msg));
    match ev {
        BenchEvent::SessionFailed {
            reason,
            stderr_tail,
        } => {
            err(format!("  [ERROR] {reason}"));
            if !stderr_tail.trim().is_empty() {
                err("  --- server stderr (last lines) ---".to_string());
                err(stderr_tail.trim_end().to_string());
                err("  ---".to_string());
            }
        }
        BenchEvent::GenerationFailed { prompt, reason } => {
            err(format!("      [FAIL] {prompt}: {reason}"));
        }
        BenchEvent::Info(info) => err(info.to_message()),
        _ if quiet => {}
        BenchEvent::RunStarted {
            backend,
            models,
            prompts,
        } => err(format!(
            "Found {models} models and {prompts} prompts, backend {backend}"
        )),
        BenchEvent::ModelStarted {
            index,
            total,
            model,
        } => {
            err(String::new());
            err(format!("== Model {index}/{total}: {model} =="));
        }
        BenchEvent::ModelSkipped { model, existing } => {
            err(format!("  [SKIP] {model}: all {existing} outputs exist"));
        }
        BenchEvent::SessionStarting { command } => {
            err(format!("  Starting: {}", command.join(" ")));
        }
        BenchEvent::SessionStarted { pid } => {
            err(format!("  Server pid {pid}, waiting for it to load the model"));
        }
        BenchEvent::SessionReady { waited } => {
            err(format!("  Ready after {:.1}s", waited.as_secs_f64()));
        }
        BenchEvent::SessionStopped { how } => {
            if let Some(how) = how {
                err(format!("  Server stopped ({})", describe_escalation(*how)));
            }
        }
        BenchEvent::PromptSkipped { prompt } => {
            err(format!("    [SKIP] output exists for {prompt}"));
        }
        BenchEvent::PromptStarted {
            index,
            total,
            prompt,
        } => err(format!("    Prompt {index}/{total}: {prompt}")),
        BenchEvent::GenerationSaved {
            prompt,
            elapsed,
            fallback,
            path,
        } => {
            let via = if *fallback { ", via fallback" } else { "" };
            err(format!(
                "      Saved {prompt} ({:.2}s{via}): {}",
                elapsed.as_secs_f64(),
                path.display()
            ));
        }
        BenchEvent::Cooldown { wait } => {
            err(format!("  Cooldown {}", humantime::format_duration(*wait)));
        }
        BenchEvent::RunCompleted => err("Run complete".to_string()),
    }
    lines
}

fn describe_escalation(how: Escalation) -> &'static str {
    match how {
        Escalation::AlreadyExited => "had already exited",
        Escalation::Interrupt => "SIGINT",
        Escalation::Terminate => "SIGTERM",
        Escalation::Kill => "SIGKILL",
    }
}
