use serde_json::Value;

/// Text segments of a Responses request that count toward input tokens.
pub(super) fn input_segments(body: &Value) -> Vec<String> {
    let mut segments = Vec::new();
    push_str(&mut segments, body.get("instructions"));

    match body.get("input") {
        Some(Value::String(text)) => push_text(&mut segments, text),
        Some(Value::Array(items)) => {
            for item in items {
                input_item_segments(&mut segments, item);
            }
        }
        _ => {}
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for tool in tools {
            push_str(&mut segments, tool.get("name"));
            push_str(&mut segments, tool.get("description"));
            push_raw(&mut segments, tool.get("parameters"));
        }
    }

    if let Some(format) = body.get("text").and_then(|text| text.get("format")) {
        push_str(&mut segments, format.get("name"));
        push_raw(&mut segments, format.get("schema"));
    }

    segments
}

fn input_item_segments(segments: &mut Vec<String>, item: &Value) {
    match item.get("type").and_then(Value::as_str).unwrap_or_default() {
        "message" => match item.get("content") {
            Some(Value::String(text)) => push_text(segments, text),
            Some(Value::Array(parts)) => {
                for part in parts {
                    push_str(segments, part.get("text"));
                }
            }
            _ => {}
        },
        "function_call" => {
            push_str(segments, item.get("name"));
            push_str(segments, item.get("arguments"));
        }
        "function_call_output" => push_raw(segments, item.get("output")),
        _ => {
            // Role-only messages carry `content` without a type.
            if item.get("type").is_none()
                && let Some(Value::String(text)) = item.get("content")
            {
                push_text(segments, text);
            } else {
                push_str(segments, item.get("text"));
            }
        }
    }
}

fn push_text(segments: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        segments.push(text.to_string());
    }
}

fn push_str(segments: &mut Vec<String>, value: Option<&Value>) {
    if let Some(Value::String(text)) = value {
        push_text(segments, text);
    }
}

/// Strings as-is, any other JSON in its compact form.
fn push_raw(segments: &mut Vec<String>, value: Option<&Value>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => push_text(segments, text),
        Some(other) => push_text(segments, &other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_every_counted_field() {
        let body = json!({
            "instructions": "be brief",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hello"}]},
                {"type": "function_call", "name": "lookup", "arguments": "{\"q\":1}"},
                {"type": "function_call_output", "output": {"ok": true}},
                {"type": "reasoning", "text": "thinking"},
                {"role": "user", "content": "plain"}
            ],
            "tools": [{"type": "function", "name": "lookup", "description": "find", "parameters": {"type": "object"}}],
            "text": {"format": {"type": "json_schema", "name": "out", "schema": {"type": "string"}}}
        });
        assert_eq!(
            input_segments(&body),
            vec![
                "be brief",
                "hello",
                "lookup",
                "{\"q\":1}",
                "{\"ok\":true}",
                "thinking",
                "plain",
                "lookup",
                "find",
                "{\"type\":\"object\"}",
                "out",
                "{\"type\":\"string\"}",
            ]
        );
    }

    #[test]
    fn string_input_is_one_segment() {
        let body = json!({"input": "  hi  "});
        assert_eq!(input_segments(&body), vec!["hi"]);
    }
}
