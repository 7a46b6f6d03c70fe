// Dispatch/retry orchestrator: route by model family, pick an account, call
// the backend, classify failures into pool mutations, and hand the canonical
// stream (or a collected JSON body) back to the server layer.

pub mod classify;

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::backends::{
    cloudcode, codex, copilot, cursor, route_model_family, EventAdapter, ModelFamily,
};
use crate::canonical::MessagesRequest;
use crate::error::{ProxyError, ProxyResult};
use crate::mappers::collector::collect_stream_to_json;
use crate::mappers::preprocess::strip_cache_control;
use crate::mappers::sse::SseLineBuffer;
use crate::mappers::streaming::error_chunk;
use crate::models::{AppConfig, Credentials};
use crate::pool::{AccountPool, Refresher, SelectOutcome};
use classify::{classify_status, peek_error_status, Classified};

pub type CanonicalStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub enum DispatchOutcome {
    Stream(CanonicalStream),
    Json(Value),
}

// Waits longer than this are surfaced immediately instead of slept through.
const MAX_INLINE_WAIT_MS: u64 = 60_000;
const WAIT_PADDING_MS: u64 = 500;
// Bound on consecutive no-account waits so a skewed clock cannot hang a call.
const MAX_WAIT_ROUNDS: u32 = 20;

pub struct Pools {
    pub cloudcode: Arc<AccountPool>,
    pub codex: Arc<AccountPool>,
    pub copilot: Arc<AccountPool>,
    pub cursor: Arc<AccountPool>,
}

impl Pools {
    pub fn new(config: &AppConfig) -> Self {
        let cooldown = config.default_cooldown_ms;
        let oauth = |token_url: &str, client_id: Option<&String>| Refresher::OAuth {
            token_url: token_url.to_string(),
            client_id: client_id.cloned().unwrap_or_default(),
        };
        Self {
            cloudcode: Arc::new(AccountPool::new(
                "cloudcode",
                config.pool_path("cloudcode"),
                cooldown,
                oauth(
                    "https://oauth2.googleapis.com/token",
                    config.backends.cloudcode.oauth_client_id.as_ref(),
                ),
            )),
            codex: Arc::new(AccountPool::new(
                "codex",
                config.pool_path("codex"),
                cooldown,
                oauth(
                    "https://auth.openai.com/oauth/token",
                    config.backends.codex.oauth_client_id.as_ref(),
                ),
            )),
            copilot: Arc::new(AccountPool::new(
                "copilot",
                config.pool_path("copilot"),
                cooldown,
                Refresher::CopilotMint,
            )),
            cursor: Arc::new(AccountPool::new(
                "cursor",
                config.pool_path("cursor"),
                cooldown,
                Refresher::Static,
            )),
        }
    }

    pub fn for_family(&self, family: ModelFamily) -> &Arc<AccountPool> {
        match family {
            ModelFamily::CloudCode => &self.cloudcode,
            ModelFamily::Codex => &self.codex,
            ModelFamily::Copilot => &self.copilot,
            ModelFamily::Cursor => &self.cursor,
        }
    }

    pub fn all(&self) -> [&Arc<AccountPool>; 4] {
        [&self.cloudcode, &self.codex, &self.copilot, &self.cursor]
    }

    pub async fn initialize_all(&self) {
        for pool in self.all() {
            pool.initialize().await;
        }
    }
}

fn wait_outcome(wait_ms: u64) -> Result<Duration, ProxyError> {
    if wait_ms > MAX_INLINE_WAIT_MS {
        Err(ProxyError::Unavailable {
            reset_mins: wait_ms.div_ceil(60_000),
        })
    } else {
        Ok(Duration::from_millis(wait_ms + WAIT_PADDING_MS))
    }
}

fn adapter_for(family: ModelFamily, model: &str) -> Box<dyn EventAdapter> {
    match family {
        ModelFamily::CloudCode => Box::new(cloudcode::CloudCodeStream::new(model)),
        ModelFamily::Codex => Box::new(codex::CodexStream::new(model)),
        ModelFamily::Copilot => Box::new(copilot::CopilotStream::new(model)),
        ModelFamily::Cursor => Box::new(cursor::CursorStream::new(model)),
    }
}

async fn call_backend(
    family: ModelFamily,
    request: &MessagesRequest,
    credentials: &Credentials,
    token: &str,
) -> ProxyResult<reqwest::Response> {
    match family {
        ModelFamily::CloudCode => cloudcode::send(&cloudcode::build_request(request), token).await,
        ModelFamily::Codex => codex::send(&codex::build_request(request), token).await,
        ModelFamily::Copilot => copilot::send(&copilot::build_request(request), token).await,
        ModelFamily::Cursor => {
            let (machine_id, ghost_mode) = match credentials {
                Credentials::ApiToken {
                    machine_id,
                    ghost_mode,
                    ..
                } => (machine_id.clone(), *ghost_mode),
                _ => (String::new(), false),
            };
            cursor::send(
                cursor::encode_request_body(request),
                token,
                &machine_id,
                ghost_mode,
            )
            .await
        }
    }
}

// Returns the pacing token when the stream is dropped before any output.
struct TokenRefund {
    pool: Arc<AccountPool>,
    account_id: String,
    armed: bool,
}

impl Drop for TokenRefund {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let account_id = self.account_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                debug!("Refunding pacing token for cancelled request on {}", account_id);
                pool.refund_token(&account_id).await;
            });
        }
    }
}

fn open_canonical_stream(
    response: reqwest::Response,
    mut adapter: Box<dyn EventAdapter>,
    family: ModelFamily,
    pool: Arc<AccountPool>,
    account_id: String,
    model: String,
) -> CanonicalStream {
    let stream = async_stream::stream! {
        let mut refund = TokenRefund {
            pool: Arc::clone(&pool),
            account_id: account_id.clone(),
            armed: true,
        };
        let mut upstream = response.bytes_stream();
        let mut sse = SseLineBuffer::new();
        let mut frames = cursor::FrameDecoder::new();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let payloads: Vec<String> = match family {
                        ModelFamily::Cursor => frames
                            .push(&bytes)
                            .into_iter()
                            .map(|p| String::from_utf8_lossy(&p).to_string())
                            .collect(),
                        _ => sse.push(&bytes),
                    };
                    for payload in payloads {
                        for out in adapter.process(&payload) {
                            refund.armed = false;
                            yield Ok(out);
                        }
                        if let Some(fraction) = adapter.observed_quota() {
                            let pool = Arc::clone(&pool);
                            let account_id = account_id.clone();
                            let model = model.clone();
                            tokio::spawn(async move {
                                pool.update_quota(&account_id, &model, fraction).await;
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!("Upstream stream error: {}", e);
                    refund.armed = false;
                    yield Ok(error_chunk(
                        "api_error",
                        &format!("upstream stream interrupted: {}", e),
                    ));
                    break;
                }
            }
        }

        if family != ModelFamily::Cursor {
            let tail = std::mem::take(&mut sse).finish();
            if let Some(payload) = tail {
                for out in adapter.process(&payload) {
                    refund.armed = false;
                    yield Ok(out);
                }
            }
        }

        for out in adapter.finish() {
            yield Ok(out);
        }
        refund.armed = false;
    };
    Box::pin(stream)
}

pub async fn dispatch(
    mut request: MessagesRequest,
    pools: &Pools,
    config: &AppConfig,
) -> ProxyResult<DispatchOutcome> {
    let family = route_model_family(&request.model).ok_or_else(|| {
        ProxyError::ContractViolation(format!("unknown model family: {}", request.model))
    })?;
    strip_cache_control(&mut request);

    let pool = Arc::clone(pools.for_family(family));
    let pool_size = pool.len().await;
    if pool_size == 0 {
        return Err(ProxyError::ConfigMissing(family.name()));
    }

    let max_attempts = std::cmp::max(3, pool_size + 1);
    let mut attempt = 0usize;
    let mut wait_rounds = 0u32;
    let mut last_error = String::from("no attempt made");
    // Credential and rate-limit failures keep their type when the budget
    // runs out; other failures degrade to the generic retries error.
    let mut last_typed: Option<ProxyError> = None;

    while attempt < max_attempts {
        let account = match pool.select(&request.model).await {
            SelectOutcome::Unrecoverable { invalid, disabled } => {
                // Waiting cannot help; fail now instead of sleeping through
                // cooldown rounds that will never produce an account.
                return Err(if invalid > 0 {
                    ProxyError::Unauthorized(format!(
                        "all accounts for {} are unusable ({} invalid, {} disabled); operator action required",
                        family.name(),
                        invalid,
                        disabled
                    ))
                } else {
                    ProxyError::ConfigMissing(family.name())
                });
            }
            SelectOutcome::Wait { wait_ms } => {
                let pause = wait_outcome(wait_ms)?;
                wait_rounds += 1;
                if wait_rounds > MAX_WAIT_ROUNDS {
                    return Err(ProxyError::Unavailable { reset_mins: 1 });
                }
                debug!(
                    "[{}] No account available, sleeping {}ms",
                    family.name(),
                    pause.as_millis()
                );
                sleep(pause).await;
                continue;
            }
            SelectOutcome::Selected(account) => account,
        };
        attempt += 1;

        let token = match pool.get_token_for_account(&account.id).await {
            Ok(token) => token,
            Err(e) => {
                last_error = e.to_string();
                last_typed = Some(e);
                continue;
            }
        };

        let send_result = tokio::time::timeout(
            Duration::from_secs(config.request_timeout_secs),
            call_backend(family, &request, &account.credentials, &token),
        )
        .await;

        let response = match send_result {
            Err(_) => {
                pool.record_failure(&account.id).await;
                last_error = format!("request timed out after {}s", config.request_timeout_secs);
                last_typed = None;
                continue;
            }
            Ok(Err(e)) => {
                pool.record_failure(&account.id).await;
                last_error = e.to_string();
                last_typed = None;
                continue;
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = response.text().await.unwrap_or_default();
            match classify_status(
                status,
                retry_after.as_deref(),
                &body,
                config.default_cooldown_ms,
            ) {
                Classified::Unauthorized => {
                    pool.mark_invalid(&account.id, &format!("upstream {}: {}", status, body))
                        .await;
                    last_error = format!("unauthorized ({}): {}", status, body);
                    last_typed = Some(ProxyError::Unauthorized(format!(
                        "upstream {}: {}",
                        status, body
                    )));
                }
                Classified::RateLimited { wait_ms } => {
                    pool.mark_rate_limited(&account.id, wait_ms, Some(request.model.as_str()))
                        .await;
                    last_error = format!("rate limited, cooldown {}ms", wait_ms);
                    last_typed = Some(ProxyError::RateLimited(format!(
                        "upstream 429, cooldown {}ms: {}",
                        wait_ms, body
                    )));
                }
                Classified::Upstream { status } => {
                    pool.record_failure(&account.id).await;
                    last_error = format!("upstream {}: {}", status, body);
                    last_typed = None;
                    if attempt >= max_attempts {
                        return Err(ProxyError::Upstream { status, body });
                    }
                }
            }
            continue;
        }

        // 2xx: convert the backend stream, but peek the first chunk so
        // embedded errors (the framed backend reports them in-band) still
        // rotate the pool instead of reaching the client.
        let adapter = adapter_for(family, &request.model);
        let mut stream = open_canonical_stream(
            response,
            adapter,
            family,
            Arc::clone(&pool),
            account.id.clone(),
            request.model.clone(),
        );

        let first = stream.next().await;
        let Some(Ok(first_chunk)) = first else {
            last_error = "backend stream ended before any event".to_string();
            pool.record_failure(&account.id).await;
            continue;
        };

        let first_text = String::from_utf8_lossy(&first_chunk).to_string();
        if let Some(embedded_status) = peek_error_status(&first_text) {
            match classify_status(embedded_status, None, &first_text, config.default_cooldown_ms) {
                Classified::Unauthorized => {
                    pool.mark_invalid(&account.id, "embedded auth error").await;
                    last_typed = Some(ProxyError::Unauthorized(
                        "embedded auth error from backend stream".to_string(),
                    ));
                }
                Classified::RateLimited { wait_ms } => {
                    pool.mark_rate_limited(&account.id, wait_ms, Some(request.model.as_str()))
                        .await;
                    last_typed = Some(ProxyError::RateLimited(format!(
                        "embedded rate limit from backend stream, cooldown {}ms",
                        wait_ms
                    )));
                }
                Classified::Upstream { .. } => {
                    pool.record_failure(&account.id).await;
                    last_typed = None;
                }
            }
            last_error = format!("embedded error (status {})", embedded_status);
            continue;
        }

        pool.record_success(&account.id).await;
        info!(
            "[{}] Request served by account {} (attempt {}/{})",
            family.name(),
            account.id,
            attempt,
            max_attempts
        );

        let full: CanonicalStream =
            Box::pin(futures::stream::once(async move { Ok(first_chunk) }).chain(stream));

        if request.stream {
            return Ok(DispatchOutcome::Stream(full));
        }
        let collected = collect_stream_to_json(full)
            .await
            .map_err(|e| ProxyError::Upstream {
                status: 502,
                body: e,
            })?;
        return Ok(DispatchOutcome::Json(collected));
    }

    Err(exhausted_error(last_typed, max_attempts, last_error))
}

// Budget exhausted: a final 401/403 or 429 classification keeps its type so
// the client sees the real condition; anything else is the generic error.
fn exhausted_error(
    last_typed: Option<ProxyError>,
    attempts: usize,
    last_error: String,
) -> ProxyError {
    match last_typed {
        Some(e @ ProxyError::Unauthorized(_)) | Some(e @ ProxyError::RateLimited(_)) => e,
        _ => ProxyError::RetriesExhausted {
            attempts,
            last_error,
        },
    }
}
