//! Application-level orchestration.
//!
//! This module owns the run lifecycle (the model x prompt loop, server sessions, interrupt
//! handling) and the result artifacts it leaves on disk. The CLI renders the events it
//! emits and the summary it returns.

mod controller;
mod post_process;

pub(crate) use controller::{plan_run, RunOrchestrator, RunPlan};
pub(crate) use post_process::ResultStore;
