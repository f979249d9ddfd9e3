//! Anthropic → OpenAI request translation (§4.D "Request").

use serde_json::{json, Value};

/// Translate an Anthropic Messages API request body into an OpenAI
/// chat-completions request body. `target_model` is the (already
/// model-mapped, §4.E) model name the request will be sent under, used to
/// decide the Gemini-specific `thinking` encoding.
pub fn translate_request(body: &Value, target_model: &str) -> Value {
    let is_gemini = target_model.to_ascii_lowercase().starts_with("gemini");

    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = body.get("system") {
        messages.push(translate_system(system));
    }

    if let Some(anthropic_messages) = body.get("messages").and_then(Value::as_array) {
        for message in anthropic_messages {
            translate_message(message, is_gemini, &mut messages);
        }
    }

    let mut out = json!({ "messages": messages });

    for key in ["temperature", "top_p", "stream", "max_tokens"] {
        if let Some(value) = body.get(key) {
            out[key] = value.clone();
        }
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                    }
                })
            })
            .collect();
        out["tools"] = Value::Array(mapped);
    }

    if let Some(tool_choice) = body.get("tool_choice") {
        out["tool_choice"] = translate_tool_choice(tool_choice);
    }

    if let Some(stop_sequences) = body.get("stop_sequences") {
        out["stop"] = stop_sequences.clone();
    }

    if let Some(thinking) = body.get("thinking") {
        if !is_gemini {
            let budget = thinking.get("budget_tokens").and_then(Value::as_u64);
            let effort = match budget {
                Some(b) if b <= 1024 => "low",
                Some(b) if b <= 8192 => "medium",
                Some(_) => "high",
                None => "medium",
            };
            out["reasoning"] = json!({ "effort": effort, "enabled": true });
        }
    }

    out
}

fn translate_system(system: &Value) -> Value {
    match system {
        Value::String(s) => json!({ "role": "system", "content": s }),
        Value::Array(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .map(|part| {
                    let mut v = json!({
                        "type": "text",
                        "text": part.get("text").cloned().unwrap_or(Value::Null),
                    });
                    if let Some(cc) = part.get("cache_control") {
                        v["cache_control"] = cc.clone();
                    }
                    v
                })
                .collect();
            json!({ "role": "system", "content": content })
        }
        other => json!({ "role": "system", "content": other }),
    }
}

fn translate_message(message: &Value, is_gemini: bool, out: &mut Vec<Value>) {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("");
    let content = message.get("content");

    match role {
        "user" => translate_user_message(content, out),
        "assistant" => out.push(translate_assistant_message(content, is_gemini)),
        _ => {}
    }
}

fn translate_user_message(content: Option<&Value>, out: &mut Vec<Value>) {
    let Some(content) = content else { return };

    let Some(blocks) = content.as_array() else {
        out.push(json!({ "role": "user", "content": content }));
        return;
    };

    let mut parts: Vec<Value> = Vec::new();
    for block in blocks {
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "tool_result" => {
                let tool_call_id = block.get("tool_use_id").cloned().unwrap_or(Value::Null);
                let raw_content = block.get("content").cloned().unwrap_or(Value::Null);
                let content_str = match &raw_content {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content_str,
                }));
            }
            "image" | "image_url" => {
                parts.push(translate_image_block(block));
            }
            "text" => {
                let mut v = json!({
                    "type": "text",
                    "text": block.get("text").cloned().unwrap_or(Value::Null),
                });
                if let Some(cc) = block.get("cache_control") {
                    v["cache_control"] = cc.clone();
                }
                parts.push(v);
            }
            _ => {}
        }
    }

    if !parts.is_empty() {
        out.push(json!({ "role": "user", "content": parts }));
    }
}

fn translate_image_block(block: &Value) -> Value {
    if let Some(source) = block.get("source") {
        let media_type = source
            .get("media_type")
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        if let Some(data) = source.get("data").and_then(Value::as_str) {
            let url = format!("data:{media_type};base64,{data}");
            return json!({ "type": "image_url", "image_url": { "url": url } });
        }
        if let Some(url) = source.get("url").and_then(Value::as_str) {
            return json!({ "type": "image_url", "image_url": { "url": url } });
        }
    }
    if let Some(url) = block.get("image_url").and_then(|iu| iu.get("url")) {
        return json!({ "type": "image_url", "image_url": { "url": url } });
    }
    json!({ "type": "image_url", "image_url": { "url": Value::Null } })
}

fn translate_assistant_message(content: Option<&Value>, is_gemini: bool) -> Value {
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut signature: Option<String> = None;
    let mut thinking_text: Option<String> = None;

    if let Some(blocks) = content.and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        texts.push(t.to_string());
                    }
                }
                "tool_use" => {
                    let id = block.get("id").cloned().unwrap_or(Value::Null);
                    let name = block.get("name").cloned().unwrap_or(Value::Null);
                    let input = block.get("input").cloned().unwrap_or(json!({}));
                    let arguments = serde_json::to_string(&input).unwrap_or_default();
                    let mut call = json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments },
                    });
                    if is_gemini {
                        if let Some(sig) = block.get("signature").and_then(Value::as_str) {
                            call["extra_content"] = json!({ "google": { "thought_signature": sig } });
                        }
                    }
                    tool_calls.push(call);
                }
                "thinking" => {
                    signature = block
                        .get("signature")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    thinking_text = block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                _ => {}
            }
        }
    } else if let Some(s) = content.and_then(Value::as_str) {
        texts.push(s.to_string());
    }

    let mut message = json!({
        "role": "assistant",
        "content": texts.join(""),
    });

    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    if let Some(sig) = signature {
        if !is_gemini {
            message["thinking"] = json!({
                "content": thinking_text.unwrap_or_default(),
                "signature": sig,
            });
        }
    }

    message
}

fn translate_tool_choice(tool_choice: &Value) -> Value {
    if let Some(s) = tool_choice.as_str() {
        return match s {
            "auto" => json!("auto"),
            "any" => json!("auto"),
            "none" => json!("none"),
            other => json!(other),
        };
    }
    if tool_choice.get("type").and_then(Value::as_str) == Some("tool") {
        let name = tool_choice.get("name").cloned().unwrap_or(Value::Null);
        return json!({ "type": "function", "function": { "name": name } });
    }
    tool_choice.clone()
}

/// Rewrite an Anthropic request path to its OpenAI equivalent and resolve
/// it against the provider's base URL (§4.D "Path rewrite").
pub fn translate_path(request_path: &str, base_url: &str) -> String {
    let path_without_query = request_path.split('?').next().unwrap_or(request_path);
    let new_path = if path_without_query == "/v1/messages" || path_without_query == "/messages" {
        "/chat/completions"
    } else {
        path_without_query
    };
    let trimmed_base = base_url.trim_end_matches('/');
    format!("{trimmed_base}{new_path}")
}
