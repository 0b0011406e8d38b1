//! Model-family rewrite rules.
//!
//! Rules are evaluated in order; every rule whose needle occurs in the lowercased model
//! file name is applied. Models matching nothing pass through untouched.

use crate::model::Params;

pub(crate) struct Rule<F> {
    pub name: &'static str,
    /// Lowercase substring of the model file name that triggers the rule.
    pub needle: &'static str,
    pub apply: F,
}

impl<F> Rule<F> {
    fn matches(&self, model_name_lower: &str) -> bool {
        model_name_lower.contains(self.needle)
    }
}

pub(crate) type PromptRule = Rule<fn(String) -> String>;
pub(crate) type PayloadRule = Rule<fn(&mut Params)>;

const CONCISE_THINKING: &str = "\nThink step by step but only keep a minimum draft of each thinking step, with 5 words at most. Be concise. Think concisely";

pub(crate) const DEEP_THINKING_SYSTEM: &str = "You are a deep thinking AI, you may use extremely long chains of thought to deeply consider the problem and deliberate with yourself via systematic reasoning processes to help come to a correct solution prior to answering. You should enclose your thoughts and internal monologue inside <think> </think> tags, and then provide your solution or response to the problem.\n";

/// Prompt rules shared by every backend.
pub(crate) static PROMPT_RULES: &[PromptRule] = &[Rule {
    name: "qwq",
    needle: "qwq",
    apply: |prompt| prompt + CONCISE_THINKING,
}];

pub(crate) fn apply_prompt_rules(rules: &[PromptRule], model_name: &str, prompt: String) -> String {
    let lower = model_name.to_lowercase();
    rules
        .iter()
        .filter(|r| r.matches(&lower))
        .fold(prompt, |p, r| {
            tracing::debug!(rule = r.name, model = model_name, "applying prompt rule");
            (r.apply)(p)
        })
}

/// Apply matching payload rules in order and return the names of the rules applied.
pub(crate) fn apply_payload_rules(
    rules: &[PayloadRule],
    model_name: &str,
    payload: &mut Params,
) -> Vec<&'static str> {
    let lower = model_name.to_lowercase();
    let mut applied = Vec::new();
    for rule in rules.iter().filter(|r| r.matches(&lower)) {
        tracing::debug!(rule = rule.name, model = model_name, "applying payload rule");
        (rule.apply)(payload);
        applied.push(rule.name);
    }
    applied
}

/// Lower sampling temperature used for the Qwen family on every backend.
pub(crate) fn cool_sampling(payload: &mut Params) {
    payload.insert("temperature".into(), serde_json::json!(0.4));
    payload.insert("top_k".into(), serde_json::json!(30));
}
