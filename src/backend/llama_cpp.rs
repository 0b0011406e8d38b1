//! llama.cpp `llama-server` specifics: OpenAI-compatible chat completions. There is no
//! result retrieval endpoint, so a timeout is final.

use super::filters::{cool_sampling, PayloadRule, Rule, DEEP_THINKING_SYSTEM};
use super::params::{common_generation_params, get_or};
use crate::model::{Params, PromptTemplate};
use serde_json::{json, Value};

pub(super) const GENERATE_PATH: &str = "/v1/chat/completions";
pub(super) const HEALTH_PATH: &str = "/health";

pub(super) const REQUIRED_FLAGS: &[(&[&str], &str)] = &[
    (&["--ctx-size", "-c"], "16384"),
    (&["-ngl", "--n-gpu-layers", "--gpu-layers"], "99"),
];

pub(super) static PAYLOAD_RULES: &[PayloadRule] = &[
    Rule {
        name: "qwen",
        needle: "qwen",
        apply: cool_sampling,
    },
    Rule {
        name: "deephermes",
        needle: "deephermes",
        apply: thinking_system_message,
    },
];

pub(super) fn reports_ready(body: &Value) -> bool {
    body.get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("ok"))
}

pub(super) fn default_params() -> Params {
    let common = common_generation_params();
    let mut p = Params::new();
    p.insert("max_tokens".into(), get_or(&common, "max_tokens", json!(1024)));
    p.insert("temperature".into(), get_or(&common, "temperature", json!(0.7)));
    p.insert("top_p".into(), get_or(&common, "top_p", json!(0.9)));
    // top_k is a llama.cpp extension to the OpenAI schema.
    p.insert("top_k".into(), get_or(&common, "top_k", json!(40)));
    p.insert(
        "presence_penalty".into(),
        get_or(&common, "presence_penalty", json!(0.0)),
    );
    p.insert(
        "frequency_penalty".into(),
        get_or(&common, "frequency_penalty", json!(0.0)),
    );
    p.insert("seed".into(), get_or(&common, "seed", json!(-1)));
    p.insert("stop".into(), get_or(&common, "stop", json!([])));
    p.insert("stream".into(), json!(false));
    fix_max_tokens(&mut p);
    p
}

/// The server rejects `max_tokens: 0`; ask for at least one token.
fn fix_max_tokens(p: &mut Params) {
    if p.get("max_tokens").and_then(Value::as_i64) == Some(0) {
        p.insert("max_tokens".into(), json!(1));
    }
}

pub(super) fn map_params(generic: &Params) -> Params {
    let mut p = generic.clone();
    // Responses are read in one piece.
    p.remove("stream");
    fix_max_tokens(&mut p);
    p
}

pub(super) fn apply_template(payload: &mut Params, prompt: String, template: &PromptTemplate) {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = template.system_prompt() {
        messages.push(json!({"role": "system", "content": system}));
    }
    let user = match template.append_text() {
        Some(extra) => format!("{prompt}\n{extra}"),
        None => prompt,
    };
    messages.push(json!({"role": "user", "content": user}));
    payload.insert("messages".into(), Value::Array(messages));
}

fn thinking_system_message(payload: &mut Params) {
    let messages = payload
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(list) = messages.as_array_mut() else {
        return;
    };
    let has_system = list
        .iter()
        .any(|m| m.get("role").and_then(Value::as_str) == Some("system"));
    if !has_system {
        list.insert(0, json!({"role": "system", "content": DEEP_THINKING_SYSTEM}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::filters::apply_payload_rules;

    #[test]
    fn defaults_follow_common_set() {
        let p = default_params();
        assert_eq!(p["max_tokens"], json!(24576));
        assert_eq!(p["top_p"], json!(0.95));
        assert_eq!(p["stream"], json!(false));
    }

    #[test]
    fn zero_max_tokens_becomes_one_and_stream_is_dropped() {
        let mut generic = Params::new();
        generic.insert("max_tokens".into(), json!(0));
        generic.insert("stream".into(), json!(true));
        let p = map_params(&generic);
        assert_eq!(p["max_tokens"], json!(1));
        assert!(!p.contains_key("stream"));
    }

    #[test]
    fn template_builds_system_then_user() {
        let mut p = default_params();
        let template = PromptTemplate {
            system_prompt: Some("Be brief.".into()),
            append_text: None,
        };
        apply_template(&mut p, "hello".into(), &template);
        assert_eq!(
            p["messages"],
            json!([
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hello"}
            ])
        );

        apply_template(&mut p, "hello".into(), &PromptTemplate::default());
        assert_eq!(p["messages"], json!([{"role": "user", "content": "hello"}]));
    }

    #[test]
    fn deephermes_adds_system_message_once() {
        let mut p = default_params();
        apply_template(&mut p, "q".into(), &PromptTemplate::default());
        apply_payload_rules(PAYLOAD_RULES, "deephermes-3-mistral-24b.gguf", &mut p);
        let messages = p["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], json!("system"));

        let mut q = default_params();
        let template = PromptTemplate {
            system_prompt: Some("custom".into()),
            append_text: None,
        };
        apply_template(&mut q, "q".into(), &template);
        apply_payload_rules(PAYLOAD_RULES, "deephermes-3-mistral-24b.gguf", &mut q);
        let messages = q["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], json!("custom"));
    }

    #[test]
    fn readiness_body() {
        assert!(reports_ready(&json!({"status": "ok"})));
        assert!(reports_ready(&json!({"status": "OK"})));
        assert!(!reports_ready(&json!({"status": "loading model"})));
        assert!(!reports_ready(&json!(null)));
    }
}
