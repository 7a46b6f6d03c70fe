// Chat-Completions-style backend. The long-lived account token is exchanged
// for a short-lived bearer through the token-mint endpoint; requests then use
// the standard chat wire format.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::backends::{strip_vendor_prefix, EventAdapter};
use crate::canonical::{flatten_tool_result_content, ContentBlock, MessagesRequest};
use crate::error::ProxyResult;
use crate::mappers::preprocess::extract_system_text;
use crate::mappers::streaming::StreamState;

pub const COMPLETIONS_URL: &str = "https://api.githubcopilot.com/chat/completions";
const TOKEN_MINT_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const EDITOR_VERSION: &str = "vscode/1.96.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.23.2";

#[derive(Debug, serde::Deserialize)]
struct MintResponse {
    token: String,
    expires_at: i64,
}

// Derives a short-lived bearer from the long-lived token. Errors carry the
// upstream body verbatim; the pool decides whether to latch the account.
pub async fn mint_short_lived(long_lived: &str) -> Result<(String, i64), String> {
    let client = reqwest::Client::new();
    let response = client
        .get(TOKEN_MINT_URL)
        .header("Authorization", format!("token {}", long_lived))
        .header("Editor-Version", EDITOR_VERSION)
        .header("Editor-Plugin-Version", EDITOR_PLUGIN_VERSION)
        .send()
        .await
        .map_err(|e| format!("token mint request failed: {}", e))?;

    if response.status().is_success() {
        let minted = response
            .json::<MintResponse>()
            .await
            .map_err(|e| format!("token mint parsing failed: {}", e))?;
        Ok((minted.token, minted.expires_at))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(format!("token mint failed: {}", body))
    }
}

pub fn build_request(request: &MessagesRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    let system_text = extract_system_text(request.system.as_ref());
    if !system_text.is_empty() {
        messages.push(json!({ "role": "system", "content": system_text }));
    }

    for message in &request.messages {
        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut tool_results: Vec<Value> = Vec::new();

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text: t, .. } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input, .. } => {
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() }
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    tool_results.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": flatten_tool_result_content(&content)
                    }));
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            }
        }

        // Tool results are standalone `tool` turns on this wire.
        messages.extend(tool_results);

        if !text.is_empty() || !tool_calls.is_empty() {
            let mut entry = json!({ "role": message.role });
            entry["content"] = if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            if !tool_calls.is_empty() {
                entry["tool_calls"] = json!(tool_calls);
            }
            messages.push(entry);
        }
    }

    let mut payload = json!({
        "model": strip_vendor_prefix(&request.model),
        "messages": messages,
        "stream": true
    });

    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        payload["top_p"] = json!(top_p);
    }

    if let Some(tools) = &request.tools {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut function = json!({
                    "name": tool.name,
                    "parameters": tool.input_schema.clone().unwrap_or_else(|| json!({"type": "object"}))
                });
                if let Some(description) = &tool.description {
                    function["description"] = json!(description);
                }
                json!({ "type": "function", "function": function })
            })
            .collect();
        if !wire_tools.is_empty() {
            payload["tools"] = json!(wire_tools);
        }
    }

    if let Some(tool_choice) = &request.tool_choice {
        if let Some(choice) = tool_choice.as_str() {
            let mapped = if choice == "any" { "required" } else { choice };
            payload["tool_choice"] = json!(mapped);
        } else if tool_choice.get("type").and_then(|v| v.as_str()) == Some("tool") {
            if let Some(name) = tool_choice.get("name").and_then(|v| v.as_str()) {
                payload["tool_choice"] = json!({
                    "type": "function",
                    "function": { "name": name }
                });
            }
        }
    }

    payload
}

pub async fn send(payload: &Value, bearer: &str) -> ProxyResult<reqwest::Response> {
    let client = reqwest::Client::new();
    let response = client
        .post(COMPLETIONS_URL)
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream")
        .header("Authorization", format!("Bearer {}", bearer))
        .header("Editor-Version", EDITOR_VERSION)
        .header("Editor-Plugin-Version", EDITOR_PLUGIN_VERSION)
        .header("Copilot-Integration-Id", "vscode-chat")
        .json(payload)
        .send()
        .await?;
    Ok(response)
}

pub struct CopilotStream {
    state: StreamState,
    // SSE tool_calls arrive keyed by array index; ids/names only on the first
    // chunk of each entry.
    index_keys: HashMap<u64, String>,
}

impl CopilotStream {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(model),
            index_keys: HashMap::new(),
        }
    }
}

impl EventAdapter for CopilotStream {
    fn process(&mut self, payload: &str) -> Vec<Bytes> {
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            return vec![];
        };

        let mut chunks = Vec::new();

        if let Some(usage) = event.get("usage") {
            let input = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if input > 0 || output > 0 {
                self.state.set_usage(input, output);
            }
        }

        let Some(delta) = event.pointer("/choices/0/delta") else {
            return chunks;
        };

        if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
            chunks.extend(self.state.append_text(content));
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let key = self.index_keys.get(&index).cloned();

                match key {
                    None => {
                        // New index: open a block, closing any running text
                        // first so framing stays correct even when the tool
                        // call arrives after emitted text.
                        let call_id = call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| format!("call_{}", index));
                        let name = call
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        let key = format!("tc-{}", index);
                        self.index_keys.insert(index, key.clone());
                        chunks.extend(self.state.start_tool_block(&key, &call_id, name));
                        if let Some(arguments) =
                            call.pointer("/function/arguments").and_then(|v| v.as_str())
                        {
                            chunks.extend(self.state.append_tool_args(Some(&key), arguments));
                        }
                    }
                    Some(key) => {
                        if let Some(arguments) =
                            call.pointer("/function/arguments").and_then(|v| v.as_str())
                        {
                            chunks.extend(self.state.append_tool_args(Some(&key), arguments));
                        }
                    }
                }
            }
        }

        chunks
    }

    fn finish(&mut self) -> Vec<Bytes> {
        self.state.finish()
    }

    fn produced_output(&self) -> bool {
        self.state.has_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappers::streaming::test_support::{assert_well_framed, parse_events};

    fn parse_request(raw: Value) -> MessagesRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn standard_chat_mapping() {
        let request = parse_request(json!({
            "model": "gh/gpt-4.1",
            "system": "short answers",
            "max_tokens": 512,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "c1", "name": "Bash", "input": {"cmd": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": "main.rs"}
                ]}
            ]
        }));
        let payload = build_request(&request);

        assert_eq!(payload["model"], "gpt-4.1");
        assert_eq!(payload["max_tokens"], 512);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "c1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["name"],
            "Bash"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(messages[3]["content"], "main.rs");
    }

    #[test]
    fn text_then_tool_calls_closes_text_block_first() {
        let mut adapter = CopilotStream::new("gh/gpt-4.1");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(
            r#"{"choices":[{"delta":{"content":"let me check"}}]}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"Bash","arguments":"{\"cmd\":"}}]}}]}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]}}]}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"usage":{"prompt_tokens":7,"completion_tokens":9}}"#,
        ));
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);

        // Text block closes before the tool block opens.
        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        let first_stop = names.iter().position(|e| *e == "content_block_stop").unwrap();
        let tool_start = events
            .iter()
            .position(|(e, d)| e == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .unwrap();
        assert!(first_stop < tool_start);

        let fragments: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        let parsed: Value = serde_json::from_str(&fragments).unwrap();
        assert_eq!(parsed["cmd"], "ls");

        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
        assert_eq!(delta["usage"]["input_tokens"], 7);
    }

    #[test]
    fn late_second_tool_index_gets_its_own_block() {
        let mut adapter = CopilotStream::new("gh/gpt-4.1");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"Read","arguments":"{}"}}]}}]}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"Bash","arguments":"{}"}}]}}]}"#,
        ));
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        let tool_starts: Vec<&Value> = events
            .iter()
            .filter(|(e, d)| e == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .map(|(_, d)| d)
            .collect();
        assert_eq!(tool_starts.len(), 2);
        assert_eq!(tool_starts[0]["content_block"]["id"], "c1");
        assert_eq!(tool_starts[1]["content_block"]["id"], "c2");
    }
}
