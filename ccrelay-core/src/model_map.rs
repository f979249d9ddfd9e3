//! Model mapping (§4.E): rewrite a request's `model` field via an ordered
//! exact-then-wildcard table, selecting the VL variant when the body
//! contains image content.

use crate::pattern::GlobMatcher;
use crate::provider::{ModelMapEntry, Provider};
use serde_json::Value;

/// Detect image content in an Anthropic-shaped request body:
/// `messages[].content[]` contains `type:"image"`, `type:"image_url"`, or a
/// nested `image_url` object.
pub fn body_has_image(body: &Value) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    for message in messages {
        let Some(content) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in content {
            if let Some(t) = block.get("type").and_then(Value::as_str)
                && (t == "image" || t == "image_url")
            {
                return true;
            }
            if block.get("image_url").is_some() {
                return true;
            }
        }
    }
    false
}

/// Find a replacement model name for `model` in `map`, exact match first
/// then wildcard.
fn resolve_in_map(map: &[ModelMapEntry], model: &str) -> Option<String> {
    for entry in map {
        if entry.pattern == model {
            return Some(entry.model.clone());
        }
    }
    for entry in map {
        if entry.pattern.contains('*') || entry.pattern.contains('?') {
            if GlobMatcher::new(&entry.pattern).matches(model) {
                return Some(entry.model.clone());
            }
        }
    }
    None
}

/// Apply model mapping to a raw request body. Selects `vlModelMap` when the
/// body has image content and that map is non-empty, else `modelMap`;
/// falls back to the other map if no entry is found in the primary one.
/// Returns the original bytes unchanged on parse failure or when no
/// mapping applies.
pub fn apply_model_mapping(provider: &Provider, body: &[u8]) -> Vec<u8> {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return body.to_vec(),
    };

    let Some(model) = value.get("model").and_then(Value::as_str).map(str::to_string) else {
        return body.to_vec();
    };

    let use_vl = body_has_image(&value) && !provider.vl_model_map.is_empty();
    let (primary, fallback) = if use_vl {
        (&provider.vl_model_map, &provider.model_map)
    } else {
        (&provider.model_map, &provider.vl_model_map)
    };

    let mapped = resolve_in_map(primary, &model).or_else(|| resolve_in_map(fallback, &model));

    match mapped {
        Some(new_model) => {
            value["model"] = Value::String(new_model);
            serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec())
        }
        None => body.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMode, ProviderType};

    fn provider_with_maps(model_map: Vec<(&str, &str)>, vl_map: Vec<(&str, &str)>) -> Provider {
        Provider {
            id: "p".into(),
            name: "P".into(),
            base_url: "https://example.com".into(),
            mode: ProviderMode::Inject,
            provider_type: ProviderType::Openai,
            api_key: Some("k".into()),
            auth_header: "authorization".into(),
            model_map: model_map
                .into_iter()
                .map(|(p, m)| ModelMapEntry { pattern: p.into(), model: m.into() })
                .collect(),
            vl_model_map: vl_map
                .into_iter()
                .map(|(p, m)| ModelMapEntry { pattern: p.into(), model: m.into() })
                .collect(),
            headers: Default::default(),
            enabled: true,
        }
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let provider = provider_with_maps(
            vec![("claude-3-sonnet", "exact-hit"), ("claude-*", "wildcard-hit")],
            vec![],
        );
        let body = br#"{"model":"claude-3-sonnet","messages":[]}"#;
        let out = apply_model_mapping(&provider, body);
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "exact-hit");
    }

    #[test]
    fn wildcard_match_when_no_exact() {
        let provider = provider_with_maps(vec![("claude-*", "glm-4")], vec![]);
        let body = br#"{"model":"claude-3-opus","messages":[]}"#;
        let out = apply_model_mapping(&provider, body);
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "glm-4");
    }

    #[test]
    fn no_match_leaves_body_unchanged() {
        let provider = provider_with_maps(vec![("gpt-*", "x")], vec![]);
        let body = br#"{"model":"claude-3-opus","messages":[]}"#;
        let out = apply_model_mapping(&provider, body);
        assert_eq!(out, body);
    }

    #[test]
    fn vl_map_selected_when_image_present_and_non_empty() {
        let provider = provider_with_maps(vec![("claude-*", "text-model")], vec![("claude-*", "vision-model")]);
        let body = br#"{"model":"claude-3","messages":[{"role":"user","content":[{"type":"image","source":{}}]}]}"#;
        let out = apply_model_mapping(&provider, body);
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "vision-model");
    }

    #[test]
    fn vl_map_empty_falls_back_to_model_map_despite_image() {
        let provider = provider_with_maps(vec![("claude-*", "text-model")], vec![]);
        let body = br#"{"model":"claude-3","messages":[{"role":"user","content":[{"type":"image_url","image_url":{"url":"x"}}]}]}"#;
        let out = apply_model_mapping(&provider, body);
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "text-model");
    }

    #[test]
    fn nested_image_url_object_detected() {
        let body: Value = serde_json::from_str(
            r#"{"model":"x","messages":[{"role":"user","content":[{"image_url":{"url":"data:..."}}]}]}"#,
        )
        .unwrap();
        assert!(body_has_image(&body));
    }

    #[test]
    fn parse_failure_returns_original_bytes() {
        let provider = provider_with_maps(vec![("*", "x")], vec![]);
        let body = b"not json";
        let out = apply_model_mapping(&provider, body);
        assert_eq!(out, body);
    }

    #[test]
    fn missing_model_field_returns_original_bytes() {
        let provider = provider_with_maps(vec![("*", "x")], vec![]);
        let body = br#"{"messages":[]}"#;
        let out = apply_model_mapping(&provider, body);
        assert_eq!(out, body.to_vec());
    }
}
