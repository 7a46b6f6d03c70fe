// OpenAI-Responses-style backend: canonical Messages → Responses `input[]`,
// and the Responses SSE event stream back into canonical events.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::backends::EventAdapter;
use crate::canonical::{flatten_tool_result_content, ContentBlock, MessagesRequest};
use crate::error::ProxyResult;
use crate::mappers::preprocess::{extract_system_text, CODING_AGENT_PREAMBLE};
use crate::mappers::schema::sanitize_function_parameters;
use crate::mappers::streaming::StreamState;

pub const RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

// Tool declarations that spawn agents or drive a browser have no Responses
// counterpart and are dropped from the wire payload.
const DROPPED_TOOLS: &[&str] = &["Task", "dispatch_agent", "computer", "browser"];

fn web_search_tool_use_ids(request: &MessagesRequest) -> HashSet<String> {
    let mut ids = HashSet::new();
    for message in &request.messages {
        for block in message.content.blocks() {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                if name == "WebSearch" {
                    ids.insert(id);
                }
            }
        }
    }
    ids
}

fn map_tool_choice(tool_choice: &Value) -> Option<Value> {
    if let Some(choice) = tool_choice.as_str() {
        return match choice {
            "auto" | "none" => Some(json!(choice)),
            "any" => Some(json!("required")),
            _ => None,
        };
    }
    if tool_choice.get("type").and_then(|v| v.as_str()) == Some("tool") {
        let name = tool_choice.get("name").and_then(|v| v.as_str())?;
        return Some(json!({ "type": "function", "name": name }));
    }
    None
}

// Builds the Responses payload. Streaming is mandatory on this wire; callers
// that want a single JSON body collect the stream afterwards.
pub fn build_request(request: &MessagesRequest) -> Value {
    let system_text = extract_system_text(request.system.as_ref());
    let instructions = if system_text.is_empty() {
        CODING_AGENT_PREAMBLE.to_string()
    } else {
        format!("{}\n\n{}", CODING_AGENT_PREAMBLE, system_text)
    };

    let web_ids = web_search_tool_use_ids(request);
    let mut input: Vec<Value> = Vec::new();

    for message in &request.messages {
        let part_type = if message.role == "assistant" {
            "output_text"
        } else {
            "input_text"
        };
        let mut text_parts: Vec<Value> = Vec::new();
        let flush_text = |input: &mut Vec<Value>, parts: &mut Vec<Value>| {
            if parts.is_empty() {
                return;
            }
            input.push(json!({
                "type": "message",
                "role": message.role,
                "content": std::mem::take(parts)
            }));
        };

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text, .. } => {
                    if !text.is_empty() {
                        text_parts.push(json!({ "type": part_type, "text": text }));
                    }
                }
                ContentBlock::ToolUse {
                    id, name, input: args, ..
                } => {
                    if web_ids.contains(&id) {
                        continue;
                    }
                    flush_text(&mut input, &mut text_parts);
                    input.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": args.to_string()
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    if web_ids.contains(&tool_use_id) {
                        continue;
                    }
                    flush_text(&mut input, &mut text_parts);
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": flatten_tool_result_content(&content)
                    }));
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            }
        }
        flush_text(&mut input, &mut text_parts);
    }

    let mut payload = json!({
        "model": request.model,
        "instructions": instructions,
        "input": input,
        "stream": true,
        "store": false,
        "parallel_tool_calls": true,
        "reasoning": { "effort": "medium", "summary": "auto" }
    });

    if let Some(tools) = &request.tools {
        let mut wire_tools: Vec<Value> = Vec::new();
        for tool in tools {
            if tool.name == "WebSearch" {
                wire_tools.push(json!({ "type": "web_search" }));
                continue;
            }
            if DROPPED_TOOLS.contains(&tool.name.as_str()) {
                continue;
            }
            let schema = tool.input_schema.clone().unwrap_or_else(|| json!({}));
            let mut entry = json!({
                "type": "function",
                "name": tool.name,
                "parameters": sanitize_function_parameters(&schema)
            });
            if let Some(description) = &tool.description {
                entry["description"] = json!(description);
            }
            wire_tools.push(entry);
        }
        if !wire_tools.is_empty() {
            payload["tools"] = json!(wire_tools);
        }
    }

    if let Some(tool_choice) = &request.tool_choice {
        if let Some(mapped) = map_tool_choice(tool_choice) {
            payload["tool_choice"] = mapped;
        }
    }

    payload
}

pub async fn send(payload: &Value, access_token: &str) -> ProxyResult<reqwest::Response> {
    let client = reqwest::Client::new();
    let response = client
        .post(RESPONSES_URL)
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream")
        .header("Authorization", format!("Bearer {}", access_token))
        .header("OpenAI-Beta", "responses=experimental")
        .header("Originator", "codex_cli_rs")
        .header("Session_id", uuid::Uuid::new_v4().to_string())
        .json(payload)
        .send()
        .await?;
    Ok(response)
}

pub struct CodexStream {
    state: StreamState,
    // Web-search items run inside the backend; their lifecycle events are
    // suppressed from the canonical stream.
    web_search_items: HashSet<String>,
}

impl CodexStream {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(model),
            web_search_items: HashSet::new(),
        }
    }
}

impl EventAdapter for CodexStream {
    fn process(&mut self, payload: &str) -> Vec<Bytes> {
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            return vec![];
        };
        let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "response.output_text.delta" => {
                let delta = event.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                self.state.append_text(delta)
            }
            "response.output_item.added" => {
                let Some(item) = event.get("item") else {
                    return vec![];
                };
                let item_id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
                match item.get("type").and_then(|v| v.as_str()) {
                    Some("function_call") => {
                        let call_id = item
                            .get("call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or(item_id);
                        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        self.state.start_tool_block(item_id, call_id, name)
                    }
                    Some("web_search_call") => {
                        self.web_search_items.insert(item_id.to_string());
                        vec![]
                    }
                    _ => vec![],
                }
            }
            "response.function_call_arguments.delta" => {
                let item_id = event.get("item_id").and_then(|v| v.as_str());
                if let Some(id) = item_id {
                    if self.web_search_items.contains(id) {
                        return vec![];
                    }
                }
                let delta = event.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                self.state.append_tool_args(item_id, delta)
            }
            "response.function_call_arguments.done" => {
                let item_id = event.get("item_id").and_then(|v| v.as_str());
                let arguments = event.get("arguments").and_then(|v| v.as_str());
                self.state.finalize_tool_args(item_id, arguments)
            }
            "response.output_item.done" => {
                let Some(item) = event.get("item") else {
                    return vec![];
                };
                let item_id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
                if self.web_search_items.contains(item_id) {
                    return vec![];
                }
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    return self.state.close_tool_block(item_id);
                }
                vec![]
            }
            "response.completed" => {
                let usage = event.pointer("/response/usage");
                let input_tokens = usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let output_tokens = usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                self.state.set_usage(input_tokens, output_tokens);
                vec![]
            }
            _ => vec![],
        }
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
    use crate::mappers::preprocess::strip_cache_control;
    use crate::mappers::streaming::test_support::{assert_well_framed, parse_events};

    fn parse_request(raw: Value) -> MessagesRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn single_turn_text_stream_matches_contract() {
        let mut adapter = CodexStream::new("gpt-5.1-codex");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(r#"{"type":"response.output_text.delta","delta":"hello"}"#));
        chunks.extend(adapter.process(
            r#"{"type":"response.completed","response":{"usage":{"input_tokens":1,"output_tokens":1}}}"#,
        ));
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[1].1["content_block"]["type"], "text");
        assert_eq!(events[2].1["delta"]["text"], "hello");
        let (_, delta) = &events[4];
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["input_tokens"], 1);
    }

    #[test]
    fn tool_call_stream_matches_contract() {
        let mut adapter = CodexStream::new("gpt-5.1-codex");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(
            r#"{"type":"response.output_item.added","item":{"type":"function_call","id":"i1","call_id":"c1","name":"Bash"}}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"type":"response.function_call_arguments.delta","item_id":"i1","delta":"{\"cmd\":"}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"type":"response.function_call_arguments.delta","item_id":"i1","delta":"\"ls\"}"}"#,
        ));
        chunks.extend(adapter.process(r#"{"type":"response.function_call_arguments.done","item_id":"i1"}"#));
        chunks.extend(adapter.process(r#"{"type":"response.completed","response":{}}"#));
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        assert_eq!(events[1].1["content_block"]["type"], "tool_use");
        assert_eq!(events[1].1["content_block"]["id"], "c1");
        assert_eq!(events[1].1["content_block"]["name"], "Bash");

        let fragments: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        let parsed: Value = serde_json::from_str(&fragments).unwrap();
        assert_eq!(parsed["cmd"], "ls");

        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn web_search_rewiring_drops_conversation_traces() {
        let mut request = parse_request(json!({
            "model": "gpt-5.1-codex",
            "tools": [
                {"name": "WebSearch", "input_schema": {"type": "object"}},
                {"name": "Bash", "input_schema": {"type": "object", "properties": {"cmd": {"type": "string"}}}}
            ],
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "ws1", "name": "WebSearch", "input": {"query": "rust"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "ws1", "content": "results"}
                ]},
                {"role": "user", "content": "now run ls"}
            ]
        }));
        strip_cache_control(&mut request);
        let payload = build_request(&request);

        let tools = payload["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["type"] == "web_search"));
        let bash = tools.iter().find(|t| t["name"] == "Bash").unwrap();
        assert_eq!(bash["type"], "function");
        assert_eq!(bash["parameters"]["type"], "object");

        let input = payload["input"].as_array().unwrap();
        assert!(
            !input.iter().any(|i| i["type"] == "function_call"),
            "WebSearch tool_use must be removed"
        );
        assert!(
            !input.iter().any(|i| i["type"] == "function_call_output"),
            "matching tool_result must be removed"
        );
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn agent_spawning_tools_are_dropped() {
        let request = parse_request(json!({
            "model": "gpt-5.1-codex",
            "tools": [
                {"name": "Task", "input_schema": {}},
                {"name": "computer", "input_schema": {}},
                {"name": "Read", "input_schema": {"type": "object"}}
            ],
            "messages": []
        }));
        let payload = build_request(&request);
        let tools = payload["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "Read");
    }

    #[test]
    fn tool_choice_translation() {
        let mut request = parse_request(json!({
            "model": "gpt-5.1-codex",
            "tool_choice": "any",
            "messages": []
        }));
        assert_eq!(build_request(&request)["tool_choice"], "required");

        request.tool_choice = Some(json!("auto"));
        assert_eq!(build_request(&request)["tool_choice"], "auto");

        request.tool_choice = Some(json!({"type": "tool", "name": "Bash"}));
        let payload = build_request(&request);
        assert_eq!(payload["tool_choice"]["type"], "function");
        assert_eq!(payload["tool_choice"]["name"], "Bash");
    }

    #[test]
    fn roles_map_to_input_and_output_text() {
        let request = parse_request(json!({
            "model": "gpt-5.1-codex",
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "a"}
            ]
        }));
        let payload = build_request(&request);
        assert!(payload["instructions"]
            .as_str()
            .unwrap()
            .contains("be brief"));
        let input = payload["input"].as_array().unwrap();
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn tool_use_and_result_become_function_call_pairs() {
        let request = parse_request(json!({
            "model": "gpt-5.1-codex",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "c9", "name": "Bash", "input": {"cmd": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c9", "content": [
                        {"type": "text", "text": "main.rs"}
                    ]}
                ]}
            ]
        }));
        let payload = build_request(&request);
        let input = payload["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "c9");
        let arguments: Value = serde_json::from_str(input[1]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments["cmd"], "ls");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "main.rs");
    }

    #[test]
    fn web_search_lifecycle_events_are_suppressed() {
        let mut adapter = CodexStream::new("gpt-5.1-codex");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(
            r#"{"type":"response.output_item.added","item":{"type":"web_search_call","id":"ws1"}}"#,
        ));
        chunks.extend(adapter.process(
            r#"{"type":"response.output_item.done","item":{"type":"web_search_call","id":"ws1"}}"#,
        ));
        chunks.extend(adapter.process(r#"{"type":"response.output_text.delta","delta":"answer"}"#));
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        assert!(!events
            .iter()
            .any(|(_, d)| d["content_block"]["type"] == "tool_use"));
    }
}
