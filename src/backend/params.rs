//! Common generation parameters and the name mapping helpers backends use to derive their
//! own defaults from them.

use crate::model::Params;
use serde_json::{json, Value};

/// Backend-neutral sampling parameters. Each backend maps these onto its own field names.
pub fn common_generation_params() -> Params {
    let mut p = Params::new();
    p.insert("max_tokens".into(), json!(24576));
    p.insert("temperature".into(), json!(0.7));
    p.insert("top_k".into(), json!(64));
    p.insert("top_p".into(), json!(0.95));
    p.insert("presence_penalty".into(), json!(0.0));
    p.insert("frequency_penalty".into(), json!(0.0));
    p.insert("seed".into(), json!(-1));
    p.insert("stop".into(), json!([]));
    p
}

/// Move `from` to `to` if present. An existing `to` value is overwritten.
pub fn rename(params: &mut Params, from: &str, to: &str) {
    if let Some(v) = params.remove(from) {
        params.insert(to.to_string(), v);
    }
}

/// Value of `key` in `params`, or `default` when missing.
pub fn get_or(params: &Params, key: &str, default: Value) -> Value {
    params.get(key).cloned().unwrap_or(default)
}

/// Shallow merge: keys in `overrides` replace keys in `base`.
pub fn merge(base: &mut Params, overrides: Params) {
    for (k, v) in overrides {
        base.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_moves_value_and_replaces_target() {
        let mut p = Params::new();
        p.insert("max_tokens".into(), json!(10));
        p.insert("max_length".into(), json!(1));
        rename(&mut p, "max_tokens", "max_length");
        assert_eq!(p.get("max_length"), Some(&json!(10)));
        assert!(!p.contains_key("max_tokens"));

        rename(&mut p, "missing", "other");
        assert!(!p.contains_key("other"));
    }

    #[test]
    fn merge_prefers_overrides() {
        let mut base = common_generation_params();
        let mut o = Params::new();
        o.insert("temperature".into(), json!(0.2));
        o.insert("min_p".into(), json!(0.05));
        merge(&mut base, o);
        assert_eq!(base["temperature"], json!(0.2));
        assert_eq!(base["min_p"], json!(0.05));
        assert_eq!(base["top_k"], json!(64));
    }
}
