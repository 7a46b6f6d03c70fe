// One adapter per upstream wire protocol. The dispatcher routes by model
// family, builds the backend payload, and feeds raw stream payloads through
// the backend's EventAdapter to get canonical events back.

pub mod cloudcode;
pub mod codex;
pub mod copilot;
pub mod cursor;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    CloudCode,
    Codex,
    Copilot,
    Cursor,
}

impl ModelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ModelFamily::CloudCode => "cloudcode",
            ModelFamily::Codex => "codex",
            ModelFamily::Copilot => "copilot",
            ModelFamily::Cursor => "cursor",
        }
    }
}

// Prefix table: cu/|cursor/ → Cursor, gh/|github/ → Copilot, claude-*/gemini-*
// → CloudCode, gpt-5*|*codex* → Codex. Unknown models are a client error.
pub fn route_model_family(model: &str) -> Option<ModelFamily> {
    if model.starts_with("cu/") || model.starts_with("cursor/") {
        return Some(ModelFamily::Cursor);
    }
    if model.starts_with("gh/") || model.starts_with("github/") {
        return Some(ModelFamily::Copilot);
    }
    if model.starts_with("claude-") || model.starts_with("gemini-") {
        return Some(ModelFamily::CloudCode);
    }
    if model.starts_with("gpt-5") || model.contains("codex") {
        return Some(ModelFamily::Codex);
    }
    None
}

// Vendor prefixes exist only on the proxy side; upstream sees the bare name.
pub fn strip_vendor_prefix(model: &str) -> &str {
    for prefix in ["cu/", "cursor/", "gh/", "github/"] {
        if let Some(rest) = model.strip_prefix(prefix) {
            return rest;
        }
    }
    model
}

// Turns one backend stream payload into zero or more canonical SSE chunks.
pub trait EventAdapter: Send {
    fn process(&mut self, payload: &str) -> Vec<Bytes>;
    fn finish(&mut self) -> Vec<Bytes>;
    // Whether anything was emitted yet; drives the cancel-refund rule.
    fn produced_output(&self) -> bool;
    // Quota telemetry observed on the stream, if the backend reports any.
    fn observed_quota(&mut self) -> Option<f64> {
        None
    }
}
