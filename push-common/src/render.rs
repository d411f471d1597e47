//! §4.5 steps 3-5: locale fallback, `{{key}}` substitution and per-service envelope shape.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::model::Params;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("static regex"))
}

/// `template.defaults ⊕ job.context`: `context` wins over `defaults` for keys both define;
/// missing keys keep whatever `defaults` already supplied.
pub fn merge_params(defaults: &Params, context: &Params) -> Params {
    let mut merged = defaults.clone();
    merged.extend(context.clone());
    merged
}

fn value_to_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitutes every `{{key}}` occurrence in `input` with `merged[key]`. A key absent from
/// `merged` leaves the literal token in place (§4.5 step 4: "Missing keys leave the literal
/// token in place").
pub fn render_string(input: &str, merged: &Params) -> String {
    token_re()
        .replace_all(input, |caps: &regex::Captures| {
            let key = &caps[1];
            match merged.get(key) {
                Some(value) => value_to_token(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Renders every string-valued entry of `body` through [`render_string`]; non-string entries
/// (nested objects, numbers) pass through unchanged, since only placeholder *strings* are
/// templated.
pub fn render_body(body: &Params, merged: &Params) -> Params {
    body.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => Value::String(render_string(s, merged)),
                other => other.clone(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn context_overrides_defaults() {
        let defaults = params(&[("user_name", json!("Someone")), ("object_name", json!("village"))]);
        let context = params(&[("user_name", json!("Everyone"))]);

        let merged = merge_params(&defaults, &context);
        assert_eq!(merged["user_name"], json!("Everyone"));
        assert_eq!(merged["object_name"], json!("village"));
    }

    #[test]
    fn renders_known_tokens_and_leaves_unknown_ones() {
        let merged = params(&[("user_name", json!("Ana"))]);
        let rendered = render_string("{{user_name}} just liked your {{object_name}}!", &merged);
        assert_eq!(rendered, "Ana just liked your {{object_name}}!");
    }

    #[test]
    fn render_body_is_deterministic_r2() {
        let body = params(&[("alert", json!("Hi {{user_name}}"))]);
        let merged = params(&[("user_name", json!("Ana"))]);
        let once = render_body(&body, &merged);
        let twice = render_body(&body, &merged);
        assert_eq!(
            serde_json::to_vec(&once).unwrap(),
            serde_json::to_vec(&twice).unwrap()
        );
    }

    #[test]
    fn non_string_body_values_pass_through() {
        let body = params(&[("badge", json!(1)), ("alert", json!("hi {{name}}"))]);
        let merged = params(&[("name", json!("Ana"))]);
        let rendered = render_body(&body, &merged);
        assert_eq!(rendered["badge"], json!(1));
        assert_eq!(rendered["alert"], json!("hi Ana"));
    }
}
