//! OpenAI → Anthropic response translation, non-streaming JSON only
//! (§4.D "Response").

use crate::ConvertError;
use serde_json::{json, Value};

/// Translate a single OpenAI chat-completion JSON response body into an
/// Anthropic Messages response body.
pub fn translate_response(body: &Value) -> Result<Value, ConvertError> {
    let message = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ConvertError::Malformed("missing choices[0].message".to_string()))?;

    let mut content: Vec<Value> = Vec::new();

    let thought_signature = find_thought_signature(message);
    let mut emitted_thinking = false;
    if let Some(sig) = &thought_signature {
        let thinking = message
            .get("thinking")
            .and_then(|t| t.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("");
        content.push(json!({ "type": "thinking", "thinking": thinking, "signature": sig }));
        emitted_thinking = true;
    }

    let text = message.get("content").and_then(Value::as_str).unwrap_or("");
    let tool_calls = message.get("tool_calls").and_then(Value::as_array);

    if !text.is_empty() {
        content.push(json!({ "type": "text", "text": text }));
    } else if tool_calls.map(|c| !c.is_empty()).unwrap_or(false) && !emitted_thinking {
        content.push(json!({ "type": "text", "text": "" }));
    }

    if let Some(calls) = tool_calls {
        for call in calls {
            let id = call.get("id").cloned().unwrap_or(Value::Null);
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .cloned()
                .unwrap_or(Value::Null);
            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let input = serde_json::from_str(arguments)
                .unwrap_or_else(|_| json!({ "text": arguments }));
            content.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
        }
    }

    if let Some(annotations) = message.get("annotations").and_then(Value::as_array) {
        for annotation in annotations {
            if let Some(citation) = annotation.get("url_citation") {
                let tool_use_id = format!("srvtoolu_{}", uuid::Uuid::new_v4());
                let query = citation
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                content.push(json!({
                    "type": "server_tool_use",
                    "id": tool_use_id,
                    "name": "web_search",
                    "input": { "query": query },
                }));
                let url = citation.get("url").cloned().unwrap_or(Value::Null);
                let title = citation.get("title").cloned().unwrap_or(Value::Null);
                content.push(json!({
                    "type": "web_search_tool_result",
                    "tool_use_id": tool_use_id,
                    "content": [{ "type": "web_search_result", "url": url, "title": title }],
                }));
            }
        }
    }

    let finish_reason = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str);

    let stop_reason = match finish_reason {
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "stop_sequence",
        _ => "end_turn",
    };

    let usage = body.get("usage");
    let prompt_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_i64).unwrap_or(0);
    let completion_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_i64).unwrap_or(0);
    let cached_tokens = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    Ok(json!({
        "type": "message",
        "role": "assistant",
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": prompt_tokens - cached_tokens,
            "output_tokens": completion_tokens,
            "cache_read_input_tokens": cached_tokens,
        },
    }))
}

fn find_thought_signature(message: &Value) -> Option<String> {
    if let Some(sig) = message.get("thinking").and_then(|t| t.get("signature")).and_then(Value::as_str) {
        return Some(sig.to_string());
    }
    let calls = message.get("tool_calls").and_then(Value::as_array)?;
    for call in calls {
        if let Some(sig) = call
            .get("extra_content")
            .and_then(|e| e.get("google"))
            .and_then(|g| g.get("thought_signature"))
            .and_then(Value::as_str)
        {
            return Some(sig.to_string());
        }
        if let Some(sig) = call
            .get("function")
            .and_then(|f| f.get("thought_signature"))
            .and_then(Value::as_str)
        {
            return Some(sig.to_string());
        }
    }
    None
}

/// Build the Anthropic-shaped `502` error body emitted on a translation
/// failure (§4.D "Failure").
pub fn error_body(message: &str) -> Value {
    json!({ "type": "error", "error": { "type": "api_error", "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_choices_is_malformed() {
        let body = json!({});
        assert!(translate_response(&body).is_err());
    }

    #[test]
    fn plain_text_response_maps_stop_reason_and_usage() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hi there" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 },
        });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["content"][0]["type"], "text");
        assert_eq!(out["content"][0]["text"], "hi there");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 10);
        assert_eq!(out["usage"]["output_tokens"], 5);
    }

    #[test]
    fn tool_calls_without_text_emit_empty_text_block_first() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{ "id": "c1", "function": { "name": "search", "arguments": "{\"q\":\"x\"}" } }]
                },
                "finish_reason": "tool_calls",
            }],
        });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["content"][0]["type"], "text");
        assert_eq!(out["content"][0]["text"], "");
        assert_eq!(out["content"][1]["type"], "tool_use");
        assert_eq!(out["content"][1]["name"], "search");
        assert_eq!(out["content"][1]["input"]["q"], "x");
        assert_eq!(out["stop_reason"], "tool_use");
    }

    #[test]
    fn malformed_tool_arguments_fall_back_to_text_wrapper() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{ "id": "c1", "function": { "name": "f", "arguments": "not json" } }]
                },
                "finish_reason": "tool_calls",
            }],
        });
        let out = translate_response(&body).unwrap();
        let tool_use = out["content"].as_array().unwrap().iter().find(|b| b["type"] == "tool_use").unwrap();
        assert_eq!(tool_use["input"]["text"], "not json");
    }

    #[test]
    fn thought_signature_from_thinking_field_emits_leading_block() {
        let body = json!({
            "choices": [{
                "message": { "content": "answer", "thinking": { "content": "reasoning", "signature": "sig" } },
                "finish_reason": "stop",
            }],
        });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["signature"], "sig");
        assert_eq!(out["content"][1]["type"], "text");
    }

    #[test]
    fn thought_signature_from_tool_call_extra_content() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "c1",
                        "function": { "name": "f", "arguments": "{}" },
                        "extra_content": { "google": { "thought_signature": "gsig" } },
                    }]
                },
                "finish_reason": "tool_calls",
            }],
        });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["signature"], "gsig");
    }

    #[test]
    fn url_citation_annotation_produces_paired_blocks() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "see sources",
                    "annotations": [{ "url_citation": { "url": "https://x", "title": "X" } }]
                },
                "finish_reason": "stop",
            }],
        });
        let out = translate_response(&body).unwrap();
        let blocks = out["content"].as_array().unwrap();
        assert_eq!(blocks[1]["type"], "server_tool_use");
        assert_eq!(blocks[1]["name"], "web_search");
        assert_eq!(blocks[2]["type"], "web_search_tool_result");
        assert_eq!(blocks[2]["tool_use_id"], blocks[1]["id"]);
    }

    #[test]
    fn cached_tokens_subtracted_from_input_tokens() {
        let body = json!({
            "choices": [{ "message": { "content": "x" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 20, "prompt_tokens_details": { "cached_tokens": 30 } },
        });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["usage"]["input_tokens"], 70);
        assert_eq!(out["usage"]["cache_read_input_tokens"], 30);
    }

    #[test]
    fn finish_reason_content_filter_maps_to_stop_sequence() {
        let body = json!({ "choices": [{ "message": { "content": "x" }, "finish_reason": "content_filter" }] });
        let out = translate_response(&body).unwrap();
        assert_eq!(out["stop_reason"], "stop_sequence");
        assert_eq!(out["stop_sequence"], Value::Null);
    }
}
