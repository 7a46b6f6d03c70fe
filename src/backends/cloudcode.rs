// Cloud-Code backend: canonical Messages → the internal generateContent wire,
// SSE candidates back into canonical events. Quota telemetry rides on the
// response metadata when present.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::backends::EventAdapter;
use crate::canonical::{flatten_tool_result_content, ContentBlock, MessagesRequest};
use crate::error::ProxyResult;
use crate::mappers::preprocess::extract_system_text;
use crate::mappers::streaming::StreamState;

pub const GENERATE_URL: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:streamGenerateContent?alt=sse";

pub fn build_request(request: &MessagesRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    // functionResponse correlates to the preceding functionCall by function
    // name; the opaque tool_use_id only rides along as the response id.
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let mut parts: Vec<Value> = Vec::new();
        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text, .. } => {
                    if !text.is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                }
                ContentBlock::ToolUse { id, name, input, .. } => {
                    tool_id_to_name.insert(id.clone(), name.clone());
                    parts.push(json!({
                        "functionCall": { "name": name, "args": input }
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = tool_id_to_name
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    parts.push(json!({
                        "functionResponse": {
                            "name": name,
                            "id": tool_use_id,
                            "response": { "output": flatten_tool_result_content(&content) }
                        }
                    }));
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            }
        }
        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    let mut inner = json!({ "contents": contents });

    let system_text = extract_system_text(request.system.as_ref());
    if !system_text.is_empty() {
        inner["systemInstruction"] = json!({ "parts": [{ "text": system_text }] });
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool.input_schema.clone().unwrap_or_else(|| json!({"type": "object"}))
                })
            })
            .collect();
        if !declarations.is_empty() {
            inner["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    let mut generation_config = json!({});
    if let Some(max_tokens) = request.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        generation_config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        generation_config["topP"] = json!(top_p);
    }
    if let Some(stop) = &request.stop_sequences {
        generation_config["stopSequences"] = json!(stop);
    }
    if generation_config.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
        inner["generationConfig"] = generation_config;
    }

    json!({ "model": request.model, "request": inner })
}

pub async fn send(payload: &Value, access_token: &str) -> ProxyResult<reqwest::Response> {
    let client = reqwest::Client::new();
    let response = client
        .post(GENERATE_URL)
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream")
        .header("Authorization", format!("Bearer {}", access_token))
        .json(payload)
        .send()
        .await?;
    Ok(response)
}

pub struct CloudCodeStream {
    state: StreamState,
    tool_counter: usize,
    // Free-fraction observed in quota telemetry, if the stream carried any.
    pub observed_quota: Option<f64>,
}

impl CloudCodeStream {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(model),
            tool_counter: 0,
            observed_quota: None,
        }
    }
}

impl EventAdapter for CloudCodeStream {
    fn process(&mut self, payload: &str) -> Vec<Bytes> {
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            return vec![];
        };
        // Both enveloped and bare candidate payloads occur on this wire.
        let body = event.get("response").unwrap_or(&event);

        let mut chunks = Vec::new();

        if let Some(parts) = body
            .pointer("/candidates/0/content/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    chunks.extend(self.state.append_text(text));
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    let item_id = format!("cloudcode-tool-{}", self.tool_counter);
                    self.tool_counter += 1;
                    let call_id = format!("toolu_{}", uuid::Uuid::new_v4().simple());
                    chunks.extend(self.state.start_tool_block(&item_id, &call_id, name));
                    chunks.extend(
                        self.state
                            .append_tool_args(Some(&item_id), &args.to_string()),
                    );
                    chunks.extend(self.state.close_tool_block(&item_id));
                }
            }
        }

        if let Some(usage) = body.get("usageMetadata") {
            let input = usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let output = usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if input > 0 || output > 0 {
                self.state.set_usage(input, output);
            }
        }

        if let Some(remaining) = body
            .pointer("/quotaMetadata/remainingFraction")
            .and_then(|v| v.as_f64())
        {
            self.observed_quota = Some(remaining);
        }

        chunks
    }

    fn finish(&mut self) -> Vec<Bytes> {
        self.state.finish()
    }

    fn produced_output(&self) -> bool {
        self.state.has_started()
    }

    fn observed_quota(&mut self) -> Option<f64> {
        self.observed_quota.take()
    }
}
