// Collects a canonical SSE stream into one complete Messages response.
// Backends that only speak streaming are always streamed internally; this is
// how non-stream clients get their single JSON body.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::io;

#[derive(Debug)]
struct PendingBlock {
    block_type: String,
    text: String,
    tool_id: String,
    tool_name: String,
    tool_args: String,
}

pub async fn collect_stream_to_json<S>(mut stream: S) -> Result<Value, String>
where
    S: futures::Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    let mut message_id = String::from("msg_unknown");
    let mut model = String::new();
    let mut stop_reason = Value::Null;
    let mut usage = json!({ "input_tokens": 0, "output_tokens": 0 });
    let mut content: Vec<Value> = Vec::new();
    let mut pending: Option<PendingBlock> = None;

    let mut current_event = String::new();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("Stream error: {}", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(rest) = line.strip_prefix("event: ") {
                current_event = rest.to_string();
                continue;
            }
            let Some(rest) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(data) = serde_json::from_str::<Value>(rest) else {
                continue;
            };

            match current_event.as_str() {
                "message_start" => {
                    if let Some(message) = data.get("message") {
                        if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                            message_id = id.to_string();
                        }
                        if let Some(m) = message.get("model").and_then(|v| v.as_str()) {
                            model = m.to_string();
                        }
                    }
                }
                "content_block_start" => {
                    let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                    let block_type = block
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("text")
                        .to_string();
                    pending = Some(PendingBlock {
                        block_type,
                        text: String::new(),
                        tool_id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        tool_name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        tool_args: String::new(),
                    });
                }
                "content_block_delta" => {
                    if let Some(block) = pending.as_mut() {
                        let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                        match delta.get("type").and_then(|v| v.as_str()) {
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                    block.text.push_str(text);
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(fragment) =
                                    delta.get("partial_json").and_then(|v| v.as_str())
                                {
                                    block.tool_args.push_str(fragment);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "content_block_stop" => {
                    if let Some(block) = pending.take() {
                        match block.block_type.as_str() {
                            "tool_use" => {
                                let input: Value = if block.tool_args.trim().is_empty() {
                                    json!({})
                                } else {
                                    serde_json::from_str(&block.tool_args)
                                        .unwrap_or_else(|_| json!({}))
                                };
                                content.push(json!({
                                    "type": "tool_use",
                                    "id": block.tool_id,
                                    "name": block.tool_name,
                                    "input": input
                                }));
                            }
                            _ => {
                                content.push(json!({ "type": "text", "text": block.text }));
                            }
                        }
                    }
                }
                "message_delta" => {
                    if let Some(reason) = data.pointer("/delta/stop_reason") {
                        stop_reason = reason.clone();
                    }
                    if let Some(u) = data.get("usage") {
                        usage = u.clone();
                    }
                }
                "error" => {
                    let message = data
                        .pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("stream error");
                    return Err(message.to_string());
                }
                _ => {}
            }
        }
    }

    Ok(json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage
    }))
}
