// Incremental SSE line discipline shared by every streaming adapter: buffer
// bytes, split on newline, keep `data:` payloads, ignore `[DONE]` and
// malformed lines.

pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    // Feeds a chunk and returns every complete data payload it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(rest) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = rest.trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }
            payloads.push(payload.to_string());
        }
        payloads
    }

    // Whatever is buffered after the stream ends, if it happens to be a
    // complete unterminated data line.
    pub fn finish(self) -> Option<String> {
        let line = self.buffer.trim_end_matches(['\n', '\r']);
        let payload = line.strip_prefix("data:")?.trim().to_string();
        if payload.is_empty() || payload == "[DONE]" {
            None
        } else {
            Some(payload)
        }
    }
}

impl Default for SseLineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
