// Canonical event emission shared by every streaming adapter. One StreamState
// per request tracks block indices and framing so that every
// content_block_start is paired with exactly one content_block_stop before
// message_delta, indices are dense from 0, and the stop reason follows
// tool use.

use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;

// Canonical SSE error event, usable outside any StreamState.
pub fn error_chunk(error_type: &str, message: &str) -> Bytes {
    let data = json!({
        "type": "error",
        "error": { "type": error_type, "message": message }
    });
    Bytes::from(format!(
        "event: error\ndata: {}\n\n",
        serde_json::to_string(&data).unwrap_or_default()
    ))
}

struct ToolBlock {
    index: usize,
    closed: bool,
    args_seen: String,
}

pub struct StreamState {
    started: bool,
    finished: bool,
    text_index: Option<usize>,
    tool_blocks: HashMap<String, ToolBlock>,
    tool_order: Vec<String>,
    next_index: usize,
    has_tool_use: bool,
    input_tokens: u64,
    output_tokens: u64,
    message_id: String,
    model: String,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            started: false,
            finished: false,
            text_index: None,
            tool_blocks: HashMap::new(),
            tool_order: Vec::new(),
            next_index: 0,
            has_tool_use: false,
            input_tokens: 0,
            output_tokens: 0,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
        }
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn has_tool_use(&self) -> bool {
        self.has_tool_use
    }

    pub fn set_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
    }

    pub fn ensure_started(&mut self) -> Vec<Bytes> {
        if self.started {
            return vec![];
        }
        self.started = true;
        vec![self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            }),
        )]
    }

    pub fn ensure_text_block(&mut self) -> Vec<Bytes> {
        let mut chunks = self.ensure_started();
        if self.text_index.is_none() {
            let index = self.next_index;
            self.next_index += 1;
            self.text_index = Some(index);
            chunks.push(self.emit(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": { "type": "text", "text": "" }
                }),
            ));
        }
        chunks
    }

    pub fn append_text(&mut self, text: &str) -> Vec<Bytes> {
        if text.is_empty() {
            return vec![];
        }
        let mut chunks = self.ensure_text_block();
        let index = self.text_index.expect("text block open");
        chunks.push(self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "text_delta", "text": text }
            }),
        ));
        chunks
    }

    pub fn close_text_block(&mut self) -> Vec<Bytes> {
        match self.text_index.take() {
            Some(index) => vec![self.emit(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            )],
            None => vec![],
        }
    }

    // Opens a tool_use block keyed by the backend's item id. Any open text
    // block is closed first so indices stay properly nested.
    pub fn start_tool_block(&mut self, item_id: &str, call_id: &str, name: &str) -> Vec<Bytes> {
        let mut chunks = self.ensure_started();
        chunks.extend(self.close_text_block());

        let index = self.next_index;
        self.next_index += 1;
        self.has_tool_use = true;
        self.tool_blocks.insert(
            item_id.to_string(),
            ToolBlock {
                index,
                closed: false,
                args_seen: String::new(),
            },
        );
        self.tool_order.push(item_id.to_string());

        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {
                    "type": "tool_use",
                    "id": call_id,
                    "name": name,
                    "input": {}
                }
            }),
        ));
        chunks
    }

    fn resolve_tool_key(&self, item_id: Option<&str>) -> Option<String> {
        if let Some(id) = item_id {
            if self.tool_blocks.contains_key(id) {
                return Some(id.to_string());
            }
        }
        // Fallback: the most recently opened, still-open tool block.
        self.tool_order
            .iter()
            .rev()
            .find(|id| self.tool_blocks.get(*id).map(|b| !b.closed).unwrap_or(false))
            .cloned()
    }

    pub fn append_tool_args(&mut self, item_id: Option<&str>, delta: &str) -> Vec<Bytes> {
        if delta.is_empty() {
            return vec![];
        }
        let Some(key) = self.resolve_tool_key(item_id) else {
            return vec![];
        };
        let index = {
            let block = self.tool_blocks.get_mut(&key).expect("resolved tool block");
            if block.closed {
                return vec![];
            }
            block.args_seen.push_str(delta);
            block.index
        };
        vec![self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "input_json_delta", "partial_json": delta }
            }),
        )]
    }

    // The arguments-done marker is authoritative: when a final string arrives
    // and no fragments were streamed yet, it is emitted whole. Fragments that
    // already went out cannot be recalled; a mismatch is only logged.
    pub fn finalize_tool_args(&mut self, item_id: Option<&str>, final_args: Option<&str>) -> Vec<Bytes> {
        let Some(final_args) = final_args else {
            return vec![];
        };
        let Some(key) = self.resolve_tool_key(item_id) else {
            return vec![];
        };
        let seen = self
            .tool_blocks
            .get(&key)
            .map(|b| b.args_seen.clone())
            .unwrap_or_default();
        if seen.is_empty() && !final_args.is_empty() {
            return self.append_tool_args(Some(&key), final_args);
        }
        if seen != final_args {
            tracing::debug!(
                "Tool argument fragments diverge from final payload ({} vs {} bytes)",
                seen.len(),
                final_args.len()
            );
        }
        vec![]
    }

    pub fn close_tool_block(&mut self, item_id: &str) -> Vec<Bytes> {
        let Some(block) = self.tool_blocks.get_mut(item_id) else {
            return vec![];
        };
        if block.closed {
            return vec![];
        }
        block.closed = true;
        let index = block.index;
        vec![self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        )]
    }

    // Stream end: synthesize the minimal sequence when nothing was produced,
    // close whatever is still open, then message_delta + message_stop.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut chunks = Vec::new();
        if !self.started {
            chunks.extend(self.ensure_text_block());
        }
        chunks.extend(self.close_text_block());
        let open: Vec<String> = self
            .tool_order
            .iter()
            .filter(|id| {
                self.tool_blocks
                    .get(*id)
                    .map(|b| !b.closed)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in open {
            chunks.extend(self.close_tool_block(&id));
        }

        let stop_reason = if self.has_tool_use { "tool_use" } else { "end_turn" };
        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens
                }
            }),
        ));
        chunks.push(self.emit("message_stop", json!({ "type": "message_stop" })));
        chunks
    }

    // SSE error event in the canonical shape; used for mid-stream failures.
    pub fn emit_error(&self, error_type: &str, message: &str) -> Bytes {
        self.emit(
            "error",
            json!({
                "type": "error",
                "error": { "type": error_type, "message": message }
            }),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use bytes::Bytes;
    use serde_json::Value;

    // Parses emitted SSE chunks back into (event, data) pairs for assertions.
    pub fn parse_events(chunks: &[Bytes]) -> Vec<(String, Value)> {
        let text: String = chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        let mut events = Vec::new();
        let mut current_event = String::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                current_event = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                let data: Value = serde_json::from_str(rest).expect("event data is JSON");
                events.push((current_event.clone(), data));
            }
        }
        events
    }

    // Checks the block-framing contract over a full event sequence.
    pub fn assert_well_framed(events: &[(String, Value)]) {
        let mut open: Vec<i64> = Vec::new();
        let mut seen: Vec<i64> = Vec::new();
        let mut message_delta_seen = false;
        for (event, data) in events {
            match event.as_str() {
                "content_block_start" => {
                    assert!(!message_delta_seen, "block started after message_delta");
                    let index = data["index"].as_i64().unwrap();
                    assert!(!seen.contains(&index), "index {} reused", index);
                    open.push(index);
                    seen.push(index);
                }
                "content_block_stop" => {
                    let index = data["index"].as_i64().unwrap();
                    let pos = open
                        .iter()
                        .position(|i| *i == index)
                        .expect("stop without start");
                    open.remove(pos);
                }
                "message_delta" => {
                    assert!(open.is_empty(), "blocks {:?} still open at message_delta", open);
                    message_delta_seen = true;
                }
                _ => {}
            }
        }
        assert!(message_delta_seen, "missing message_delta");
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        let expected: Vec<i64> = (0..seen.len() as i64).collect();
        assert_eq!(sorted, expected, "indices must be dense from 0");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{assert_well_framed, parse_events};
    use super::*;

    #[test]
    fn text_only_stream_frames_one_block() {
        let mut state = StreamState::new("gpt-5.1-codex");
        let mut chunks = Vec::new();
        chunks.extend(state.append_text("hel"));
        chunks.extend(state.append_text("lo"));
        state.set_usage(1, 1);
        chunks.extend(state.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);
        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let (_, delta) = &events[5];
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["output_tokens"], 1);
    }

    #[test]
    fn tool_use_closes_text_and_sets_stop_reason() {
        let mut state = StreamState::new("m");
        let mut chunks = Vec::new();
        chunks.extend(state.append_text("thinking about it"));
        chunks.extend(state.start_tool_block("i1", "c1", "Bash"));
        chunks.extend(state.append_tool_args(Some("i1"), "{\"cmd\":"));
        chunks.extend(state.append_tool_args(Some("i1"), "\"ls\"}"));
        chunks.extend(state.close_tool_block("i1"));
        chunks.extend(state.finish());

        let events = parse_events(&chunks);
        assert_well_framed(&events);

        // Stop-reason law: tool_use block present implies tool_use stop.
        let (_, delta) = events
            .iter()
            .find(|(e, _)| e == "message_delta")
            .expect("message_delta present");
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");

        // Tool-argument reconstruction: fragments parse as one JSON object.
        let rebuilt: String = events
            .iter()
            .filter(|(e, d)| {
                e == "content_block_delta" && d["delta"]["type"] == "input_json_delta"
            })
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        let parsed: serde_json::Value = serde_json::from_str(&rebuilt).unwrap();
        assert_eq!(parsed["cmd"], "ls");
    }

    #[test]
    fn empty_stream_synthesizes_minimal_sequence() {
        let mut state = StreamState::new("m");
        let chunks = state.finish();
        let events = parse_events(&chunks);
        assert_well_framed(&events);
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[1].0, "content_block_start");
        assert_eq!(events[1].1["content_block"]["type"], "text");
        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn unclosed_tool_blocks_are_closed_at_finish() {
        let mut state = StreamState::new("m");
        let mut chunks = Vec::new();
        chunks.extend(state.start_tool_block("i1", "c1", "Read"));
        chunks.extend(state.start_tool_block("i2", "c2", "Bash"));
        chunks.extend(state.finish());
        let events = parse_events(&chunks);
        assert_well_framed(&events);
    }

    #[test]
    fn args_fallback_targets_most_recent_open_block() {
        let mut state = StreamState::new("m");
        let mut chunks = Vec::new();
        chunks.extend(state.start_tool_block("i1", "c1", "Read"));
        chunks.extend(state.close_tool_block("i1"));
        chunks.extend(state.start_tool_block("i2", "c2", "Bash"));
        chunks.extend(state.append_tool_args(None, "{}"));
        chunks.extend(state.finish());

        let events = parse_events(&chunks);
        let (_, delta) = events
            .iter()
            .find(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .unwrap();
        // Index 1 belongs to the second tool block.
        assert_eq!(delta["index"], 1);
    }

    #[test]
    fn done_marker_replaces_unstreamed_arguments() {
        let mut state = StreamState::new("m");
        let mut chunks = Vec::new();
        chunks.extend(state.start_tool_block("i1", "c1", "Bash"));
        chunks.extend(state.finalize_tool_args(Some("i1"), Some("{\"cmd\":\"ls\"}")));
        chunks.extend(state.finish());

        let events = parse_events(&chunks);
        let rebuilt: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(rebuilt, "{\"cmd\":\"ls\"}");
    }

    #[test]
    fn done_marker_is_noop_after_streamed_fragments() {
        let mut state = StreamState::new("m");
        let mut chunks = Vec::new();
        chunks.extend(state.start_tool_block("i1", "c1", "Bash"));
        chunks.extend(state.append_tool_args(Some("i1"), "{\"a\":1}"));
        let before = chunks.len();
        chunks.extend(state.finalize_tool_args(Some("i1"), Some("{\"a\":1}")));
        assert_eq!(chunks.len(), before);
    }
}
