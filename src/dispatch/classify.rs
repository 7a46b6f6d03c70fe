// Upstream error classification: the orchestrator is the single authority on
// whether an attempt invalidates the account, cools it down, or just retries.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    // 401/403: latch the account invalid.
    Unauthorized,
    // 429: cool the account down for wait_ms.
    RateLimited { wait_ms: u64 },
    // Other non-2xx: surface verbatim after the budget runs out.
    Upstream { status: u16 },
}

pub fn classify_status(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
    default_cooldown_ms: u64,
) -> Classified {
    match status {
        401 | 403 => Classified::Unauthorized,
        429 => Classified::RateLimited {
            wait_ms: parse_rate_limit_wait_ms(retry_after, body, default_cooldown_ms),
        },
        other => Classified::Upstream { status: other },
    }
}

static RETRY_AFTER_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:retry|try again) (?:after|in)\s*(\d+)\s*s").expect("regex"));

// Reset hint priority: Retry-After header, then body fields
// resets_in_seconds / resets_at, then a textual fallback, then the default.
pub fn parse_rate_limit_wait_ms(
    retry_after: Option<&str>,
    body: &str,
    default_cooldown_ms: u64,
) -> u64 {
    if let Some(header) = retry_after {
        if let Ok(seconds) = header.trim().parse::<u64>() {
            return seconds * 1000;
        }
    }

    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let lookup = |field: &str| {
                parsed
                    .pointer(&format!("/error/{}", field))
                    .or_else(|| parsed.get(field))
                    .cloned()
            };
            if let Some(seconds) = lookup("resets_in_seconds").and_then(|v| v.as_u64()) {
                return seconds * 1000;
            }
            if let Some(resets_at) = lookup("resets_at") {
                if let Some(ts) = resets_at.as_i64() {
                    let delta = ts - chrono::Utc::now().timestamp();
                    if delta > 0 {
                        return delta as u64 * 1000;
                    }
                }
                if let Some(iso) = resets_at.as_str() {
                    if let Ok(when) = chrono::DateTime::parse_from_rfc3339(iso) {
                        let delta = when.timestamp() - chrono::Utc::now().timestamp();
                        if delta > 0 {
                            return delta as u64 * 1000;
                        }
                    }
                }
            }
        }
    }

    if let Some(caps) = RETRY_AFTER_TEXT.captures(body) {
        if let Ok(seconds) = caps[1].parse::<u64>() {
            return seconds * 1000;
        }
    }

    default_cooldown_ms
}

// Mid-stream error events carry "status=NNN" in their message; the retry loop
// reads it back out when peeking the first chunk.
pub fn peek_error_status(chunk: &str) -> Option<u16> {
    if !chunk.starts_with("event: error") {
        return None;
    }
    let marker = chunk.find("status=")?;
    let rest = &chunk[marker + "status=".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u16>().ok().or(Some(502))
}
