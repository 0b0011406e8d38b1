//! Run lifecycle controller.
//!
//! Drives the model x prompt matrix: one server session per model, one generation per
//! missing output, and emits events for the presentation layer. The session is always
//! stopped before the next model starts and before `run` returns, including on Ctrl+C.

use super::post_process::{ResultMeta, ResultStore};
use crate::backend::Backend;
use crate::config::BenchConfig;
use crate::discovery::{self, FilterReason};
use crate::engine::{self, GenerationDispatcher, GenerationRequest, ProcessSupervisor};
use crate::error::BenchError;
use crate::metrics;
use crate::model::{
    BenchEvent, FailureRecord, InfoEvent, ModelArtifact, PromptArtifact, RunSummary,
    SessionState, ALL_PROMPTS,
};
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Stderr characters shown when a server fails to come up.
const STDERR_GLIMPSE: usize = 2000;

/// Everything the run will iterate over, discovered up front.
#[derive(Debug)]
pub(crate) struct RunPlan {
    pub models: Vec<ModelArtifact>,
    pub prompts: Vec<PromptArtifact>,
    pub filtered: Vec<(String, FilterReason)>,
}

impl RunPlan {
    pub fn total_pairs(&self) -> usize {
        self.models.len() * self.prompts.len()
    }
}

/// Scan models and prompts. Empty or missing directories are fatal.
pub(crate) fn plan_run(cfg: &BenchConfig) -> Result<RunPlan> {
    let scan = discovery::discover_models(cfg)?;
    let prompts = discovery::discover_prompts(&cfg.prompts_dir, &cfg.prompt_extension)?;
    if scan.models.is_empty() {
        bail!("no models found in {}", cfg.models_dir.display());
    }
    if prompts.is_empty() {
        bail!("no prompts found in {}", cfg.prompts_dir.display());
    }
    Ok(RunPlan {
        models: scan.models,
        prompts,
        filtered: scan.filtered,
    })
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    skipped: usize,
    /// Pairs with a failure record naming them.
    failed: usize,
    fallbacks: usize,
    elapsed: Vec<Duration>,
    failures: Vec<FailureRecord>,
}

pub(crate) struct RunOrchestrator<'a> {
    cfg: &'a BenchConfig,
    backend: Backend,
    http: reqwest::Client,
    dispatcher: GenerationDispatcher,
    store: ResultStore,
    supervisor: ProcessSupervisor,
    session: SessionState,
    event_tx: UnboundedSender<BenchEvent>,
    /// Resolves when the run should stop early. Ctrl+C unless replaced.
    interrupt: BoxFuture<'a, ()>,
    current_model: Option<String>,
    tally: Tally,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        cfg: &'a BenchConfig,
        http: reqwest::Client,
        event_tx: UnboundedSender<BenchEvent>,
    ) -> Self {
        let dispatcher = GenerationDispatcher::new(
            http.clone(),
            cfg.base_url(),
            cfg.primary_timeout,
            cfg.fallback_timeout,
        );
        Self {
            cfg,
            backend: cfg.backend,
            http,
            dispatcher,
            store: ResultStore::new(&cfg.results_dir, &cfg.output_extension),
            supervisor: ProcessSupervisor::new(cfg.stop_policy),
            session: SessionState::Stopped,
            event_tx,
            interrupt: Box::pin(ctrl_c()),
            current_model: None,
            tally: Tally::default(),
        }
    }

    /// Stop early when `signal` resolves instead of on Ctrl+C.
    #[cfg(test)]
    pub fn with_interrupt(
        mut self,
        signal: impl std::future::Future<Output = ()> + Send + 'a,
    ) -> Self {
        self.interrupt = Box::pin(signal);
        self
    }

    fn emit(&self, event: BenchEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run the whole matrix and return the summary.
    pub async fn run(mut self, plan: &RunPlan) -> Result<RunSummary> {
        self.emit(BenchEvent::RunStarted {
            backend: self.backend.name(),
            models: plan.models.len(),
            prompts: plan.prompts.len(),
        });
        for (model, reason) in &plan.filtered {
            self.emit(BenchEvent::Info(InfoEvent::ModelFiltered {
                model: model.clone(),
                reason: reason.to_string(),
            }));
        }
        self.store.ensure_dir()?;
        self.emit(BenchEvent::Info(InfoEvent::Message(format!(
            "Writing results to {}",
            self.store.dir().display()
        ))));

        let interrupt =
            std::mem::replace(&mut self.interrupt, Box::pin(futures::future::pending::<()>()));
        let interrupted = tokio::select! {
            _ = self.run_matrix(plan) => false,
            _ = interrupt => true,
        };

        if interrupted {
            self.emit(BenchEvent::Info(InfoEvent::Interrupted));
            let model = self.current_model.clone().unwrap_or_else(|| ALL_PROMPTS.to_string());
            self.tally
                .failures
                .push(FailureRecord::new(&model, ALL_PROMPTS, "interrupted"));
        }
        // The matrix future may have been dropped mid-session.
        self.stop_session().await;

        let summary = self.summary(plan, interrupted);
        self.emit(BenchEvent::RunCompleted);
        Ok(summary)
    }

    async fn run_matrix(&mut self, plan: &RunPlan) {
        let total = plan.models.len();
        for (index, model) in plan.models.iter().enumerate() {
            self.current_model = Some(model.name.clone());

            let pending: Vec<&PromptArtifact> = plan
                .prompts
                .iter()
                .filter(|p| !self.store.exists(&model.stem, &p.stem))
                .collect();
            let existing = plan.prompts.len() - pending.len();
            if pending.is_empty() {
                self.tally.skipped += existing;
                self.emit(BenchEvent::ModelSkipped {
                    model: model.name.clone(),
                    existing,
                });
                continue;
            }

            self.emit(BenchEvent::ModelStarted {
                index: index + 1,
                total,
                model: model.name.clone(),
            });
            self.run_model(model, &plan.prompts).await;
            self.stop_session().await;

            if !self.cfg.cooldown.is_zero() && self.has_pending_after(plan, index) {
                self.emit(BenchEvent::Cooldown {
                    wait: self.cfg.cooldown,
                });
                tokio::time::sleep(self.cfg.cooldown).await;
            }
        }
        self.current_model = None;
    }

    /// Whether any model after `index` still has a prompt without an output.
    fn has_pending_after(&self, plan: &RunPlan, index: usize) -> bool {
        plan.models.iter().skip(index + 1).any(|model| {
            plan.prompts
                .iter()
                .any(|p| !self.store.exists(&model.stem, &p.stem))
        })
    }

    /// One session: start, wait for readiness, then every prompt without an output.
    async fn run_model(&mut self, model: &ModelArtifact, prompts: &[PromptArtifact]) {
        if let Err(reason) = self.start_session(model).await {
            let stderr_tail = self.supervisor.stderr_tail(STDERR_GLIMPSE);
            self.emit(BenchEvent::SessionFailed {
                reason: reason.clone(),
                stderr_tail,
            });
            for prompt in prompts {
                if !self.store.exists(&model.stem, &prompt.stem) {
                    self.record_failure(&model.name, &prompt.name, &reason);
                } else {
                    self.tally.skipped += 1;
                }
            }
            return;
        }

        let total = prompts.len();
        for (index, prompt) in prompts.iter().enumerate() {
            if self.store.exists(&model.stem, &prompt.stem) {
                self.tally.skipped += 1;
                self.emit(BenchEvent::PromptSkipped {
                    prompt: prompt.name.clone(),
                });
                continue;
            }
            self.emit(BenchEvent::PromptStarted {
                index: index + 1,
                total,
                prompt: prompt.name.clone(),
            });
            self.run_prompt(model, prompt).await;
        }
    }

    async fn start_session(&mut self, model: &ModelArtifact) -> Result<(), String> {
        let command = self.backend.build_start_command(
            &self.cfg.launcher,
            &model.path,
            &model.settings.startup_args,
            &self.cfg.host,
            self.cfg.port,
        );
        self.emit(BenchEvent::SessionStarting {
            command: command.clone(),
        });
        self.session = SessionState::Starting;

        let pid = match self.supervisor.start(&command) {
            Ok(pid) => pid,
            Err(e) => {
                self.session = SessionState::Stopped;
                return Err(e.to_string());
            }
        };
        self.emit(BenchEvent::SessionStarted { pid });

        let started = Instant::now();
        let base_url = self.cfg.base_url();
        let backend = self.backend;
        let http = &self.http;
        let ready = engine::wait_until_ready(
            || backend.is_ready(http, &base_url),
            self.cfg.startup_wait,
            self.cfg.poll_interval,
        )
        .await;
        if !ready {
            let err = BenchError::ReadinessTimeout {
                waited: self.cfg.startup_wait,
            };
            tracing::warn!(model = %model.name, "{err}");
            return Err(err.to_string());
        }

        self.session = SessionState::Ready;
        self.emit(BenchEvent::SessionReady {
            waited: started.elapsed(),
        });
        Ok(())
    }

    async fn stop_session(&mut self) {
        let how = self.supervisor.stop().await;
        if self.session != SessionState::Stopped || how.is_some() {
            self.emit(BenchEvent::SessionStopped { how });
        }
        self.session = SessionState::Stopped;
    }

    async fn run_prompt(&mut self, model: &ModelArtifact, prompt: &PromptArtifact) {
        let text = match discovery::read_prompt(&prompt.path) {
            Ok(text) => text,
            Err(e) => {
                self.record_failure(&model.name, &prompt.name, &e.to_string());
                return;
            }
        };

        let request = GenerationRequest {
            model_name: &model.name,
            prompt: &text,
            params: &model.settings.generation_params,
            template: &model.settings.prompt_template,
        };
        let outcome = self.dispatcher.generate(self.backend, &request).await;

        let Some(generated) = outcome.usable_text() else {
            self.record_failure(&model.name, &prompt.name, &outcome.failure_reason());
            return;
        };

        let meta = ResultMeta {
            backend: self.backend,
            model_name: &model.name,
            prompt_name: &prompt.name,
            elapsed: outcome.elapsed,
            fallback: outcome.fallback,
        };
        match self.store.write(&model.stem, &prompt.stem, generated, &meta) {
            Ok(path) => {
                self.tally.succeeded += 1;
                self.tally.elapsed.push(outcome.elapsed);
                if outcome.fallback {
                    self.tally.fallbacks += 1;
                }
                self.emit(BenchEvent::GenerationSaved {
                    prompt: prompt.name.clone(),
                    elapsed: outcome.elapsed,
                    fallback: outcome.fallback,
                    path,
                });
            }
            Err(e) => self.record_failure(&model.name, &prompt.name, &e.to_string()),
        }
    }

    fn record_failure(&mut self, model: &str, prompt: &str, reason: &str) {
        self.tally.failed += 1;
        self.tally
            .failures
            .push(FailureRecord::new(model, prompt, reason));
        self.emit(BenchEvent::GenerationFailed {
            prompt: prompt.to_string(),
            reason: reason.to_string(),
        });
    }

    fn summary(&self, plan: &RunPlan, interrupted: bool) -> RunSummary {
        let total_pairs = plan.total_pairs();
        let accounted = self.tally.succeeded + self.tally.skipped + self.tally.failed;
        RunSummary {
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            backend: self.backend.name().to_string(),
            models: plan.models.len(),
            prompts: plan.prompts.len(),
            total_pairs,
            succeeded: self.tally.succeeded,
            skipped: self.tally.skipped,
            failed: self.tally.failed,
            not_run: total_pairs.saturating_sub(accounted),
            interrupted,
            failures: self.tally.failures.clone(),
            timing: metrics::timing_summary(&self.tally.elapsed, self.tally.fallbacks),
        }
    }
}

/// Resolves on the first Ctrl+C. If the handler cannot be installed it never resolves.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl+C");
        futures::future::pending::<()>().await;
    }
}
