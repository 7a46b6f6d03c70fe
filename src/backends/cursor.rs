// Length-prefixed binary backend. The wire is a sequence of frames
// (flag byte + u32 big-endian length + payload, flags 0x01..0x03 = gzip),
// carrying JSON payloads both ways, plus a scrambled checksum header and
// per-call random request identifiers.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use sha2::Digest;
use std::io::{Read, Write};

use crate::backends::{strip_vendor_prefix, EventAdapter};
use crate::canonical::{flatten_tool_result_content, ContentBlock, MessagesRequest};
use crate::error::ProxyResult;
use crate::mappers::preprocess::{extract_system_text, SYSTEM_HEADER};
use crate::mappers::streaming::StreamState;

pub const CHAT_RPC_URL: &str =
    "https://api2.cursor.sh/aiserver.v1.ChatService/StreamUnifiedChatWithTools";

const FLAG_RAW: u8 = 0x00;
const FLAG_GZIP: u8 = 0x01;
const CHECKSUM_XOR_SEED: u8 = 165;

// ---- frame codec ----

pub fn encode_frame(payload: &[u8], gzip: bool) -> Vec<u8> {
    let (flag, body) = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).expect("gzip into memory");
        (FLAG_GZIP, encoder.finish().expect("gzip finish"))
    } else {
        (FLAG_RAW, payload.to_vec())
    };
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(flag);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

// Incremental decoder: push raw bytes, get back decompressed payloads.
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        loop {
            if self.buffer.len() < 5 {
                break;
            }
            let flag = self.buffer[0];
            let len = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;
            if self.buffer.len() < 5 + len {
                break;
            }
            let body: Vec<u8> = self.buffer[5..5 + len].to_vec();
            self.buffer.drain(..5 + len);

            if (0x01..=0x03).contains(&flag) {
                let mut decoder = GzDecoder::new(&body[..]);
                let mut decompressed = Vec::new();
                match decoder.read_to_end(&mut decompressed) {
                    Ok(_) => payloads.push(decompressed),
                    Err(e) => {
                        tracing::warn!("[Cursor] Dropping undecodable gzip frame: {}", e);
                    }
                }
            } else {
                payloads.push(body);
            }
        }
        payloads
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---- identity headers ----

// Timestamp-derived bytes scrambled under a rolling XOR key, base64url
// encoded and suffixed with the machine identifier.
pub fn generate_checksum(machine_id: &str) -> String {
    let ts = (chrono::Utc::now().timestamp_millis() / 1_000_000) as u64;
    let mut bytes = [
        ((ts >> 40) & 0xFF) as u8,
        ((ts >> 32) & 0xFF) as u8,
        ((ts >> 24) & 0xFF) as u8,
        ((ts >> 16) & 0xFF) as u8,
        ((ts >> 8) & 0xFF) as u8,
        (ts & 0xFF) as u8,
    ];
    let mut key = CHECKSUM_XOR_SEED;
    for byte in bytes.iter_mut() {
        *byte ^= key;
        key = *byte;
    }
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    format!("{}{}", encoded, machine_id)
}

pub fn client_key(token: &str) -> String {
    let digest = sha2::Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---- request adapter ----

// The canonical conversation collapses to the intermediate
// {model, messages, tools, reasoningEffort} this wire's encoder takes.
pub fn build_intermediate(request: &MessagesRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    let system_text = extract_system_text(request.system.as_ref());
    if !system_text.is_empty() {
        // No system slot on this wire; it leads the conversation as a user turn.
        messages.push(json!({
            "role": "user",
            "content": format!("{}\n{}", SYSTEM_HEADER, system_text)
        }));
    }

    for message in &request.messages {
        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text: t, .. } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input, .. } => {
                    tool_calls.push(json!({
                        "id": id,
                        "name": name,
                        "arguments": input.to_string()
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    messages.push(json!({
                        "role": "user",
                        "toolResult": {
                            "id": tool_use_id,
                            "output": flatten_tool_result_content(&content)
                        }
                    }));
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            }
        }
        if !text.is_empty() || !tool_calls.is_empty() {
            let mut entry = json!({ "role": message.role, "content": text });
            if !tool_calls.is_empty() {
                entry["toolCalls"] = json!(tool_calls);
            }
            messages.push(entry);
        }
    }

    let tools: Vec<Value> = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description.clone().unwrap_or_default(),
                "parameters": tool.input_schema.clone().unwrap_or_else(|| json!({"type": "object"}))
            })
        })
        .collect();

    json!({
        "model": strip_vendor_prefix(&request.model),
        "messages": messages,
        "tools": tools,
        "reasoningEffort": "medium"
    })
}

pub fn encode_request_body(request: &MessagesRequest) -> Vec<u8> {
    let intermediate = build_intermediate(request);
    let payload = serde_json::to_vec(&intermediate).unwrap_or_default();
    encode_frame(&payload, true)
}

pub async fn send(
    body: Vec<u8>,
    token: &str,
    machine_id: &str,
    ghost_mode: bool,
) -> ProxyResult<reqwest::Response> {
    let client = reqwest::Client::new();
    let response = client
        .post(CHAT_RPC_URL)
        .header("Content-Type", "application/connect+json")
        .header("Authorization", format!("Bearer {}", token))
        .header("x-cursor-checksum", generate_checksum(machine_id))
        .header("x-client-key", client_key(token))
        .header("x-ghost-mode", if ghost_mode { "true" } else { "false" })
        .header("x-request-id", uuid::Uuid::new_v4().to_string())
        .header("x-session-id", uuid::Uuid::new_v4().to_string())
        .header("x-cursor-config-version", uuid::Uuid::new_v4().to_string())
        .header("x-amzn-trace-id", format!("Root={}", uuid::Uuid::new_v4()))
        .body(body)
        .send()
        .await?;
    Ok(response)
}

// ---- streaming adapter ----

pub struct CursorStream {
    state: StreamState,
    tool_counter: usize,
}

impl CursorStream {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(model),
            tool_counter: 0,
        }
    }

    // Maps an embedded error payload to the HTTP-ish status the retry loop
    // classifies on.
    pub fn error_status(error: &Value) -> u16 {
        let code = error
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let combined = format!("{} {}", code, message);
        if combined.contains("unauthenticated")
            || combined.contains("unauthorized")
            || combined.contains("permission")
            || combined.contains("forbidden")
        {
            401
        } else if combined.contains("resource_exhausted")
            || combined.contains("rate")
            || combined.contains("quota")
        {
            429
        } else {
            502
        }
    }
}

impl EventAdapter for CursorStream {
    fn process(&mut self, payload: &str) -> Vec<Bytes> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
            // Bare text payloads happen; pass them through as content.
            return self.state.append_text(trimmed);
        };

        if let Some(error) = event.get("error") {
            let status = Self::error_status(error);
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("upstream error");
            let error_type = match status {
                401 => "authentication_error",
                429 => "rate_limit_error",
                _ => "api_error",
            };
            return vec![self
                .state
                .emit_error(error_type, &format!("status={} {}", status, message))];
        }

        let mut chunks = Vec::new();
        if let Some(text) = event.get("text").and_then(|v| v.as_str()) {
            chunks.extend(self.state.append_text(text));
        }
        if let Some(tool_call) = event.get("toolCall") {
            let item_id = format!("cursor-tool-{}", self.tool_counter);
            self.tool_counter += 1;
            let call_id = tool_call
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| item_id.clone());
            let name = tool_call.get("name").and_then(|v| v.as_str()).unwrap_or("");
            chunks.extend(self.state.start_tool_block(&item_id, &call_id, name));
            let arguments = match tool_call.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            if !arguments.is_empty() {
                chunks.extend(self.state.append_tool_args(Some(&item_id), &arguments));
            }
            chunks.extend(self.state.close_tool_block(&item_id));
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

    #[test]
    fn frames_round_trip_raw_and_gzip() {
        let payload = br#"{"text":"hello frames"}"#;
        let mut decoder = FrameDecoder::new();

        let raw = encode_frame(payload, false);
        assert_eq!(raw[0], 0x00);
        let out = decoder.push(&raw);
        assert_eq!(out, vec![payload.to_vec()]);

        let gz = encode_frame(payload, true);
        assert_eq!(gz[0], 0x01);
        let out = decoder.push(&gz);
        assert_eq!(out, vec![payload.to_vec()]);
    }

    #[test]
    fn decoder_handles_split_and_concatenated_frames() {
        let a = encode_frame(b"one", false);
        let b = encode_frame(b"two", true);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        // Feed in awkward chunk sizes.
        let out1 = decoder.push(&joined[..3]);
        assert!(out1.is_empty());
        let out2 = decoder.push(&joined[3..joined.len() - 2]);
        let out3 = decoder.push(&joined[joined.len() - 2..]);
        let mut all = out1;
        all.extend(out2);
        all.extend(out3);
        assert_eq!(all, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn checksum_shape_is_stable() {
        let checksum = generate_checksum("machine-abc");
        assert!(checksum.ends_with("machine-abc"));
        // 6 scrambled bytes base64url without padding is 8 characters.
        assert_eq!(checksum.len(), 8 + "machine-abc".len());
        assert!(!checksum.contains('='));
    }

    #[test]
    fn client_key_is_sha256_hex() {
        let key = client_key("token-1");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, client_key("token-2"));
    }

    #[test]
    fn intermediate_carries_system_as_user_header_turn() {
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "cu/claude-4.5-opus",
            "system": "keep output short",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let intermediate = build_intermediate(&request);
        assert_eq!(intermediate["model"], "claude-4.5-opus");
        let messages = intermediate["messages"].as_array().unwrap();
        let first = messages[0]["content"].as_str().unwrap();
        assert!(first.starts_with("[System Instructions]"));
        assert!(first.contains("keep output short"));
        assert_eq!(intermediate["reasoningEffort"], "medium");
    }

    #[test]
    fn request_body_is_one_gzip_frame_of_the_intermediate() {
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "cu/gpt-4o",
            "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap();
        let body = encode_request_body(&request);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&body);
        assert_eq!(payloads.len(), 1);
        let intermediate: Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(intermediate["model"], "gpt-4o");
    }

    #[test]
    fn text_and_tool_payloads_stream_canonically() {
        let mut adapter = CursorStream::new("cu/claude-4.5-opus");
        let mut chunks = Vec::new();
        chunks.extend(adapter.process(r#"{"text":"checking"}"#));
        chunks.extend(
            adapter.process(r#"{"toolCall":{"id":"t1","name":"Bash","arguments":"{\"cmd\":\"ls\"}"}}"#),
        );
        chunks.extend(adapter.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn embedded_errors_surface_with_status() {
        let mut adapter = CursorStream::new("cu/gpt-4o");
        let chunks = adapter.process(r#"{"error":{"code":"RESOURCE_EXHAUSTED","message":"slow down"}}"#);
        let text = String::from_utf8_lossy(&chunks[0]).to_string();
        assert!(text.contains("rate_limit_error"));
        assert!(text.contains("status=429"));

        let auth = adapter.process(r#"{"error":{"code":"UNAUTHENTICATED","message":"bad token"}}"#);
        let text = String::from_utf8_lossy(&auth[0]).to_string();
        assert!(text.contains("authentication_error"));
        assert!(text.contains("status=401"));
    }
}
