//! Text summary builder for CLI output.
//!
//! Formats the end-of-run summary and the dry-run plan as human-readable lines.

use crate::model::RunSummary;
use crate::orchestrator::{ResultStore, RunPlan};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let rule = "=".repeat(60);
    let mut lines = vec![rule.clone()];

    lines.push(if summary.interrupted {
        "Benchmark interrupted".to_string()
    } else {
        "Benchmark finished".to_string()
    });
    lines.push(format!(
        "Backend: {}  Models: {}  Prompts: {}  Pairs: {}",
        summary.backend, summary.models, summary.prompts, summary.total_pairs
    ));
    let mut counts = format!(
        "Succeeded: {}  Skipped: {}  Failed: {}",
        summary.succeeded, summary.skipped, summary.failed
    );
    if summary.not_run > 0 {
        counts.push_str(&format!("  Not run: {}", summary.not_run));
    }
    lines.push(counts);

    if let Some(t) = &summary.timing {
        lines.push(format!(
            "Generation time: avg {:.2}s med {:.2}s p25 {:.2}s p75 {:.2}s ({} samples, {} via fallback)",
            t.mean_secs, t.median_secs, t.p25_secs, t.p75_secs, t.samples, t.fallbacks
        ));
    }

    if !summary.failures.is_empty() {
        lines.push(format!("Failures ({}):", summary.failures.len()));
        for f in &summary.failures {
            lines.push(format!("  - {} | {} : {}", f.model, f.prompt, f.reason));
        }
    }
    lines.push(rule);
    TextSummary { lines }
}

/// One line per model and one per pair, marking pairs that already have an output.
pub(crate) fn build_plan_lines(plan: &RunPlan, store: &ResultStore) -> Vec<String> {
    let mut lines = Vec::new();
    let mut todo = 0usize;
    for (i, model) in plan.models.iter().enumerate() {
        lines.push(format!(
            "Model {}/{}: {} ({:.2} GiB)",
            i + 1,
            plan.models.len(),
            model.name,
            model.size_bytes as f64 / (1u64 << 30) as f64
        ));
        for prompt in &plan.prompts {
            let done = store.exists(&model.stem, &prompt.stem);
            if !done {
                todo += 1;
            }
            let mark = if done { "done" } else { "todo" };
            lines.push(format!("  [{mark}] {}", prompt.name));
        }
    }
    lines.push(format!(
        "{todo} of {} pairs would run; results go to {}",
        plan.total_pairs(),
        store.dir().display()
    ));
    lines
}
