// Common request pre-processing applied before any backend adapter runs.

use crate::canonical::{ContentBlock, MessageContent, MessagesRequest, SystemPrompt};

// Backends that take no system prompt get it prepended as a user turn under
// this header.
pub const SYSTEM_HEADER: &str = "[System Instructions]";

// Injected ahead of the caller's system prompt on backends that expect an
// agent preamble in `instructions`.
pub const CODING_AGENT_PREAMBLE: &str = "You are an autonomous coding agent \
operating inside a developer's terminal. Complete the user's task end to end, \
using the provided tools when needed, and report results concisely.";

// Caching markers are a client-side hint with no wire counterpart anywhere.
pub fn strip_cache_control(request: &mut MessagesRequest) {
    if let Some(SystemPrompt::Blocks(blocks)) = request.system.as_mut() {
        for block in blocks.iter_mut() {
            block.cache_control = None;
        }
    }
    if let Some(tools) = request.tools.as_mut() {
        for tool in tools.iter_mut() {
            tool.cache_control = None;
        }
    }
    for message in request.messages.iter_mut() {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            for block in blocks.iter_mut() {
                match block {
                    ContentBlock::Text { cache_control, .. }
                    | ContentBlock::ToolUse { cache_control, .. }
                    | ContentBlock::ToolResult { cache_control, .. } => {
                        *cache_control = None;
                    }
                    ContentBlock::Thinking { body } | ContentBlock::RedactedThinking { body } => {
                        body.remove("cache_control");
                    }
                }
            }
        }
    }
}

// A string or a sequence of text blocks becomes a single concatenated string.
pub fn extract_system_text(system: Option<&SystemPrompt>) -> String {
    match system {
        Some(SystemPrompt::Text(text)) => text.clone(),
        Some(SystemPrompt::Blocks(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect();
            parts.join("\n")
        }
        None => String::new(),
    }
}
