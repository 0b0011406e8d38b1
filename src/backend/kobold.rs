//! KoboldCpp specifics: KoboldAI-style `/api/v1/generate` with a raw instruct prompt, and
//! result retrieval through `/api/extra/generate/check` keyed by `genkey`.

use super::filters::{cool_sampling, PayloadRule, Rule, DEEP_THINKING_SYSTEM};
use super::params::{common_generation_params, get_or, rename};
use super::FallbackRequest;
use crate::model::{Params, PromptTemplate};
use rand::RngCore;
use serde_json::{json, Value};

pub(super) const GENERATE_PATH: &str = "/api/v1/generate";
pub(super) const CHECK_PATH: &str = "/api/extra/generate/check";
pub(super) const MODEL_PATH: &str = "/api/v1/model";

pub(super) const INPUT_MARKER: &str = "{{[INPUT]}}";
pub(super) const OUTPUT_MARKER: &str = "{{[OUTPUT]}}";

pub(super) const REQUIRED_FLAGS: &[(&[&str], &str)] =
    &[(&["--contextsize"], "16384"), (&["--gpulayers"], "96")];

const SYSTEM_HEADER: &str = "<|start_header_id|>system<|end_header_id|>\n\n";
const USER_HEADER: &str = "<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n";
const ASSISTANT_HEADER: &str = "<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

pub(super) static PAYLOAD_RULES: &[PayloadRule] = &[
    Rule {
        name: "qwen",
        needle: "qwen",
        apply: cool_sampling,
    },
    Rule {
        name: "deephermes",
        needle: "deephermes",
        apply: llama3_thinking_prompt,
    },
    Rule {
        name: "reka-flash",
        needle: "reka-flash",
        apply: reka_prompt,
    },
];

/// The model endpoint reports `inactive` until a model has been loaded.
pub(super) fn reports_ready(body: &Value) -> bool {
    body.get("result")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty() && !s.eq_ignore_ascii_case("inactive"))
}

pub(super) fn default_params() -> Params {
    let common = common_generation_params();
    let mut p = Params::new();
    p.insert("n".into(), json!(1));
    p.insert("max_context_length".into(), json!(16384));
    p.insert("max_length".into(), get_or(&common, "max_tokens", json!(1024)));
    p.insert("rep_pen".into(), get_or(&common, "repeat_penalty", json!(1.1)));
    p.insert("temperature".into(), get_or(&common, "temperature", json!(0.7)));
    p.insert("top_p".into(), get_or(&common, "top_p", json!(0.95)));
    p.insert("top_k".into(), get_or(&common, "top_k", json!(40)));
    p.insert("top_a".into(), json!(0));
    p.insert("typical".into(), json!(1));
    p.insert("tfs".into(), json!(1));
    p.insert("rep_pen_range".into(), json!(160));
    p.insert("rep_pen_slope".into(), json!(0.7));
    p.insert("sampler_order".into(), json!([6, 0, 1, 3, 4, 2, 5]));
    p.insert("memory".into(), json!(""));
    p.insert("trim_stop".into(), json!(true));
    p.insert("min_p".into(), json!(0));
    p.insert("dynatemp_range".into(), json!(0));
    p.insert("dynatemp_exponent".into(), json!(1));
    p.insert("smoothing_factor".into(), json!(0));
    p.insert("nsigma".into(), json!(0));
    p.insert("banned_tokens".into(), json!([]));
    p.insert("render_special".into(), json!(false));
    p.insert("logprobs".into(), json!(false));
    p.insert("replace_instruct_placeholders".into(), json!(true));
    p.insert("presence_penalty".into(), get_or(&common, "presence_penalty", json!(0)));
    p.insert("logit_bias".into(), json!({}));
    p.insert("quiet".into(), json!(true));
    p.insert("stop_sequence".into(), json!([INPUT_MARKER, OUTPUT_MARKER]));
    p.insert("use_default_badwordsids".into(), json!(false));
    p.insert("bypass_eos".into(), json!(false));
    p.insert("seed".into(), get_or(&common, "seed", json!(-1)));
    p
}

pub(super) fn map_params(generic: &Params) -> Params {
    let mut p = generic.clone();
    // An empty generic stop list would wipe the instruct-marker stops.
    if p.get("stop").and_then(Value::as_array).is_some_and(Vec::is_empty) {
        p.remove("stop");
    }
    rename(&mut p, "max_tokens", "max_length");
    rename(&mut p, "repeat_penalty", "rep_pen");
    rename(&mut p, "stop", "stop_sequence");
    p.remove("frequency_penalty");
    p.insert("quiet".into(), json!(true));
    p
}

pub(super) fn apply_template(payload: &mut Params, prompt: String, template: &PromptTemplate) {
    let body = match template.append_text() {
        Some(extra) => format!("{prompt}\n{extra}"),
        None => prompt,
    };
    payload.insert(
        "prompt".into(),
        json!(format!("{INPUT_MARKER} {body} {OUTPUT_MARKER}")),
    );
    if let Some(system) = template.system_prompt() {
        payload.insert("memory".into(), json!(system));
    }
}

/// The user prompt with the instruct markers removed.
fn instruct_body(payload: &Params) -> String {
    let prompt = payload.get("prompt").and_then(Value::as_str).unwrap_or_default();
    let after_input = prompt
        .split_once(INPUT_MARKER)
        .map_or(prompt, |(_, rest)| rest);
    let body = after_input
        .rsplit_once(OUTPUT_MARKER)
        .map_or(after_input, |(body, _)| body);
    body.trim().to_string()
}

fn llama3_thinking_prompt(payload: &mut Params) {
    let body = instruct_body(payload);
    payload.insert(
        "prompt".into(),
        json!(format!("{USER_HEADER}{body}{ASSISTANT_HEADER}")),
    );
    payload.insert(
        "memory".into(),
        json!(format!("{SYSTEM_HEADER}{DEEP_THINKING_SYSTEM}")),
    );
    payload.insert("stop_sequence".into(), json!([USER_HEADER, ASSISTANT_HEADER]));
}

fn reka_prompt(payload: &mut Params) {
    let body = instruct_body(payload);
    payload.insert(
        "prompt".into(),
        json!(format!("human:\n{body}<sep> assistant:")),
    );
    payload.insert("stop_sequence".into(), json!(["<sep> human:", "human:"]));
}

fn generation_key(model_name: &str) -> String {
    let prefix: String = model_name
        .chars()
        .take(10)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut b = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut b);
    format!(
        "KCPP_BENCH_{}_{}_{:08x}",
        prefix,
        time::OffsetDateTime::now_utc().unix_timestamp(),
        u32::from_le_bytes(b)
    )
}

pub(super) fn attach_generation_key(model_name: &str, payload: &mut Params) -> FallbackRequest {
    let key = generation_key(model_name);
    payload.insert("genkey".into(), json!(key));
    FallbackRequest {
        endpoint: CHECK_PATH,
        payload: json!({ "genkey": key }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::filters::apply_payload_rules;

    fn templated(prompt: &str) -> Params {
        let mut p = default_params();
        apply_template(&mut p, prompt.to_string(), &PromptTemplate::default());
        p
    }

    #[test]
    fn defaults_are_mapped_from_common_names() {
        let p = default_params();
        assert_eq!(p["max_length"], json!(24576));
        assert_eq!(p["top_k"], json!(64));
        assert_eq!(p["rep_pen"], json!(1.1));
        assert!(!p.contains_key("max_tokens"));
        assert_eq!(p["stop_sequence"], json!([INPUT_MARKER, OUTPUT_MARKER]));
    }

    #[test]
    fn generic_overrides_are_renamed() {
        let mut generic = Params::new();
        generic.insert("max_tokens".into(), json!(512));
        generic.insert("repeat_penalty".into(), json!(1.05));
        generic.insert("stop".into(), json!([]));
        let p = map_params(&generic);
        assert_eq!(p["max_length"], json!(512));
        assert_eq!(p["rep_pen"], json!(1.05));
        assert!(!p.contains_key("stop_sequence"));

        generic.insert("stop".into(), json!(["</s>"]));
        assert_eq!(map_params(&generic)["stop_sequence"], json!(["</s>"]));
    }

    #[test]
    fn template_wraps_prompt_and_sets_memory() {
        let mut p = default_params();
        let template = PromptTemplate {
            system_prompt: Some("You are terse.".into()),
            append_text: Some("Answer in English.".into()),
        };
        apply_template(&mut p, "Build a clock".into(), &template);
        assert_eq!(
            p["prompt"],
            json!("{{[INPUT]}} Build a clock\nAnswer in English. {{[OUTPUT]}}")
        );
        assert_eq!(p["memory"], json!("You are terse."));
    }

    #[test]
    fn deephermes_rule_rewrites_prompt_memory_and_stops() {
        let mut p = templated("Explain rust lifetimes");
        let applied = apply_payload_rules(PAYLOAD_RULES, "DeepHermes-3-Llama-3-8B.gguf", &mut p);
        assert_eq!(applied, vec!["deephermes"]);
        assert_eq!(
            p["prompt"],
            json!(format!("{USER_HEADER}Explain rust lifetimes{ASSISTANT_HEADER}"))
        );
        assert!(p["memory"].as_str().unwrap().starts_with(SYSTEM_HEADER));
        assert_eq!(p["stop_sequence"], json!([USER_HEADER, ASSISTANT_HEADER]));
    }

    #[test]
    fn reka_rule_uses_human_assistant_format() {
        let mut p = templated("hi");
        apply_payload_rules(PAYLOAD_RULES, "reka-flash-3-21b.gguf", &mut p);
        assert_eq!(p["prompt"], json!("human:\nhi<sep> assistant:"));
    }

    #[test]
    fn qwen_rule_lowers_temperature() {
        let mut p = templated("hi");
        apply_payload_rules(PAYLOAD_RULES, "Qwen2.5-Coder-32B.gguf", &mut p);
        assert_eq!(p["temperature"], json!(0.4));
        assert_eq!(p["top_k"], json!(30));
    }

    #[test]
    fn generation_key_is_shared_with_fallback_request() {
        let mut p = templated("hi");
        let fb = attach_generation_key("Mistral Small 24B.gguf", &mut p);
        assert_eq!(fb.endpoint, CHECK_PATH);
        assert_eq!(fb.payload["genkey"], p["genkey"]);
        let key = p["genkey"].as_str().unwrap();
        assert!(key.starts_with("KCPP_BENCH_Mistral_Sm_"));

        let mut q = templated("hi");
        attach_generation_key("Mistral Small 24B.gguf", &mut q);
        assert_ne!(q["genkey"], p["genkey"]);
    }

    #[test]
    fn readiness_body() {
        assert!(reports_ready(&json!({"result": "koboldcpp/llama"})));
        assert!(!reports_ready(&json!({"result": "inactive"})));
        assert!(!reports_ready(&json!({"result": ""})));
        assert!(!reports_ready(&json!({})));
    }
}
