// One account pool per backend: credentials plus tracker state behind a single
// pool-wide mutex, with a serialized writer task for disk persistence.

pub mod persistence;
pub mod strategy;
pub mod trackers;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountState, Credentials};
use persistence::PoolFile;
use strategy::Selection;

// Refresh an access token no later than this close to expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

struct PoolState {
    accounts: Vec<Account>,
    active_index: usize,
}

#[derive(Debug, Clone)]
pub enum SelectOutcome {
    Selected(Account),
    Wait { wait_ms: u64 },
    // Every account is invalid or disabled; only operator action recovers.
    Unrecoverable { invalid: usize, disabled: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub email: Option<String>,
    pub state: &'static str,
    pub health: f64,
    pub bucket_tokens: f64,
    pub cooldown_remaining_secs: u64,
    pub invalid_reason: Option<String>,
}

// How expiring credentials are renewed; one flavor per backend family.
#[derive(Debug, Clone)]
pub enum Refresher {
    OAuth { token_url: String, client_id: String },
    CopilotMint,
    Static,
    #[cfg(test)]
    Mock {
        counter: Arc<std::sync::atomic::AtomicUsize>,
    },
}

pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

impl Refresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, String> {
        match self {
            Refresher::OAuth {
                token_url,
                client_id,
            } => {
                let response =
                    crate::auth::oauth::refresh_access_token(token_url, client_id, refresh_token)
                        .await?;
                Ok(RefreshedToken {
                    access_token: response.access_token,
                    refresh_token: response.refresh_token,
                    expires_at: Utc::now().timestamp() + response.expires_in,
                })
            }
            Refresher::CopilotMint => {
                let (token, expires_at) =
                    crate::backends::copilot::mint_short_lived(refresh_token).await?;
                Ok(RefreshedToken {
                    access_token: token,
                    refresh_token: None,
                    expires_at,
                })
            }
            Refresher::Static => Err("backend_has_no_token_refresh".to_string()),
            #[cfg(test)]
            Refresher::Mock { counter } => {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(RefreshedToken {
                    access_token: format!("mock-token-{}", n),
                    refresh_token: None,
                    expires_at: Utc::now().timestamp() + 3600,
                })
            }
        }
    }
}

pub struct AccountPool {
    name: &'static str,
    path: PathBuf,
    default_cooldown_ms: u64,
    refresher: Refresher,
    state: Arc<Mutex<PoolState>>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    save_tx: mpsc::UnboundedSender<()>,
}

impl AccountPool {
    pub fn new(
        name: &'static str,
        path: PathBuf,
        default_cooldown_ms: u64,
        refresher: Refresher,
    ) -> Self {
        let state = Arc::new(Mutex::new(PoolState {
            accounts: Vec::new(),
            active_index: 0,
        }));
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        spawn_saver(name, Arc::clone(&state), path.clone(), save_rx);
        Self {
            name,
            path,
            default_cooldown_ms,
            refresher,
            state,
            refresh_locks: DashMap::new(),
            save_tx,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    pub async fn initialize(&self) {
        let file = persistence::load(&self.path);
        let mut state = self.state.lock().await;
        info!(
            "[{}] Loaded {} account(s) from {:?}",
            self.name,
            file.accounts.len(),
            self.path
        );
        state.accounts = file.accounts;
        state.active_index = file.active_index;
    }

    fn schedule_save(&self) {
        let _ = self.save_tx.send(());
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn add_account(&self, account: Account) {
        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.accounts.iter_mut().find(|a| a.id == account.id) {
                *existing = account;
            } else {
                state.accounts.push(account);
            }
        }
        self.schedule_save();
    }

    // Applies the hybrid strategy; token consumption and cursor advance happen
    // under the same lock as the pick.
    pub async fn select(&self, model: &str) -> SelectOutcome {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let active_index = state.active_index;
        let default_wait = self.default_cooldown_ms;
        match strategy::pick(&mut state.accounts, active_index, model, now, default_wait) {
            Selection::Picked {
                index,
                level,
                score,
            } => {
                state.active_index = (index + 1) % state.accounts.len();
                let account = state.accounts[index].clone();
                debug!(
                    "[{}] Selected {} at level {:?} (score {:.1})",
                    self.name, account.id, level, score
                );
                drop(state);
                self.schedule_save();
                SelectOutcome::Selected(account)
            }
            Selection::Wait { wait_ms } => SelectOutcome::Wait { wait_ms },
            Selection::Unrecoverable => {
                let invalid = state.accounts.iter().filter(|a| a.is_invalid).count();
                let disabled = state.accounts.iter().filter(|a| !a.enabled).count();
                SelectOutcome::Unrecoverable { invalid, disabled }
            }
        }
    }

    pub async fn mark_rate_limited(&self, account_id: &str, cooldown_ms: u64, model: Option<&str>) {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
                account.cooldown_until = Some(now + Duration::milliseconds(cooldown_ms as i64));
                account.trackers.health.record_rate_limit(now.timestamp_millis());
                if let Some(model) = model {
                    account
                        .trackers
                        .quota
                        .decay_on_rate_limit(model, now.timestamp_millis());
                }
                warn!(
                    "[{}] Account {} rate limited, cooling for {}ms",
                    self.name, account_id, cooldown_ms
                );
            }
        }
        self.schedule_save();
    }

    // Latched; only operator action clears it.
    pub async fn mark_invalid(&self, account_id: &str, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
                account.is_invalid = true;
                account.invalid_reason = Some(reason.to_string());
                warn!(
                    "[{}] Account {} marked invalid: {}",
                    self.name, account_id, reason
                );
            }
        }
        self.schedule_save();
    }

    pub async fn record_success(&self, account_id: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            account.trackers.health.record_success(now_ms);
        }
    }

    pub async fn record_failure(&self, account_id: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            account.trackers.health.record_failure(now_ms);
        }
    }

    pub async fn update_quota(&self, account_id: &str, model: &str, fraction: f64) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            account.trackers.quota.update(model, fraction, now_ms);
        }
    }

    // Returns the pacing token consumed at selection when a cancelled request
    // produced no output.
    pub async fn refund_token(&self, account_id: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            account.trackers.bucket.refund(now_ms);
        }
    }

    pub async fn clear_cooldowns(&self) {
        {
            let mut state = self.state.lock().await;
            let now_ms = Utc::now().timestamp_millis();
            for account in state.accounts.iter_mut() {
                account.cooldown_until = None;
                account.trackers = trackers::TrackerState::new(now_ms);
            }
        }
        self.schedule_save();
        info!("[{}] Cooldowns and tracker state cleared", self.name);
    }

    pub async fn snapshot(&self) -> Vec<AccountSnapshot> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let state = self.state.lock().await;
        state
            .accounts
            .iter()
            .map(|account| AccountSnapshot {
                id: account.id.clone(),
                email: account.email.clone(),
                state: match account.state(now) {
                    AccountState::Available => "available",
                    AccountState::Cooling => "cooling",
                    AccountState::Invalid => "invalid",
                    AccountState::Disabled => "disabled",
                },
                health: account.trackers.health.current(now_ms),
                bucket_tokens: account.trackers.bucket.level(now_ms),
                cooldown_remaining_secs: account.cooldown_remaining_ms(now) / 1000,
                invalid_reason: account.invalid_reason.clone(),
            })
            .collect()
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn credentials_of(&self, account_id: &str) -> ProxyResult<Credentials> {
        let state = self.state.lock().await;
        let account = state
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| ProxyError::Unauthorized(format!("unknown account {}", account_id)))?;
        if account.is_invalid {
            return Err(ProxyError::Unauthorized(format!(
                "account {} is invalid: {}",
                account_id,
                account.invalid_reason.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(account.credentials.clone())
    }

    async fn store_refreshed(&self, account_id: &str, refreshed: &RefreshedToken) {
        {
            let mut state = self.state.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.id == account_id) {
                match &mut account.credentials {
                    Credentials::OAuth {
                        access_token,
                        refresh_token,
                        expires_at,
                    } => {
                        *access_token = refreshed.access_token.clone();
                        if let Some(new_refresh) = &refreshed.refresh_token {
                            *refresh_token = new_refresh.clone();
                        }
                        *expires_at = refreshed.expires_at;
                    }
                    Credentials::Minted {
                        short_lived,
                        short_lived_expires_at,
                        ..
                    } => {
                        *short_lived = Some(refreshed.access_token.clone());
                        *short_lived_expires_at = Some(refreshed.expires_at);
                    }
                    Credentials::ApiToken { .. } => {}
                }
            }
        }
        self.schedule_save();
    }

    // Current bearer for the account, transparently refreshing credentials
    // that expire within the margin. Concurrent callers on one account share
    // a single refresh; callers on different accounts do not serialize.
    pub async fn get_token_for_account(&self, account_id: &str) -> ProxyResult<String> {
        let now = Utc::now().timestamp();
        match self.credentials_of(account_id).await? {
            Credentials::ApiToken { token, .. } => Ok(token),
            Credentials::OAuth {
                access_token,
                expires_at,
                ..
            } => {
                if expires_at - now >= TOKEN_REFRESH_MARGIN_SECS {
                    return Ok(access_token);
                }
                self.refresh_under_lock(account_id).await
            }
            Credentials::Minted {
                short_lived,
                short_lived_expires_at,
                ..
            } => {
                if let (Some(token), Some(expires_at)) = (short_lived, short_lived_expires_at) {
                    if expires_at - now >= TOKEN_REFRESH_MARGIN_SECS {
                        return Ok(token);
                    }
                }
                self.refresh_under_lock(account_id).await
            }
        }
    }

    async fn refresh_under_lock(&self, account_id: &str) -> ProxyResult<String> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while this one waited.
        let now = Utc::now().timestamp();
        let secret = match self.credentials_of(account_id).await? {
            Credentials::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => {
                if expires_at - now >= TOKEN_REFRESH_MARGIN_SECS {
                    return Ok(access_token);
                }
                refresh_token
            }
            Credentials::Minted {
                long_lived,
                short_lived,
                short_lived_expires_at,
            } => {
                if let (Some(token), Some(expires_at)) = (short_lived, short_lived_expires_at) {
                    if expires_at - now >= TOKEN_REFRESH_MARGIN_SECS {
                        return Ok(token);
                    }
                }
                long_lived
            }
            Credentials::ApiToken { token, .. } => return Ok(token),
        };

        match self.refresher.refresh(&secret).await {
            Ok(refreshed) => {
                info!("[{}] Refreshed token for account {}", self.name, account_id);
                self.store_refreshed(account_id, &refreshed).await;
                Ok(refreshed.access_token)
            }
            Err(e) => {
                self.mark_invalid(account_id, &format!("token refresh failed: {}", e))
                    .await;
                Err(ProxyError::Unauthorized(format!(
                    "token refresh failed for {}: {}",
                    account_id, e
                )))
            }
        }
    }

    // Operator hook: refresh every OAuth/minted account regardless of expiry.
    pub async fn force_refresh_all(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .accounts
                .iter()
                .filter(|a| !a.is_invalid && !matches!(a.credentials, Credentials::ApiToken { .. }))
                .map(|a| a.id.clone())
                .collect()
        };
        let mut refreshed = 0;
        for id in ids {
            let lock = self.refresh_lock(&id);
            let _guard = lock.lock().await;
            let secret = match self.credentials_of(&id).await {
                Ok(Credentials::OAuth { refresh_token, .. }) => refresh_token,
                Ok(Credentials::Minted { long_lived, .. }) => long_lived,
                _ => continue,
            };
            match self.refresher.refresh(&secret).await {
                Ok(token) => {
                    self.store_refreshed(&id, &token).await;
                    refreshed += 1;
                }
                Err(e) => warn!("[{}] Forced refresh failed for {}: {}", self.name, id, e),
            }
        }
        refreshed
    }
}

fn spawn_saver(
    name: &'static str,
    state: Arc<Mutex<PoolState>>,
    path: PathBuf,
    mut save_rx: mpsc::UnboundedReceiver<()>,
) {
    tokio::spawn(async move {
        while save_rx.recv().await.is_some() {
            // Coalesce bursts of save requests into one write.
            while save_rx.try_recv().is_ok() {}
            let file = {
                let state = state.lock().await;
                PoolFile {
                    accounts: state.accounts.clone(),
                    active_index: state.active_index,
                }
            };
            if let Err(e) = persistence::save_atomic(&path, &file) {
                warn!("[{}] [W-POOL-SAVE] {}", name, e);
            }
        }
    });
}
