use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::trackers::TrackerState;

// One credential set usable against one backend. Serialized inline into the
// account record with a `kind` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    // OAuth backends (CloudCode, Codex).
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        refresh_token: String,
        // Unix seconds.
        expires_at: i64,
    },
    // Cursor-style static API token bound to a machine identity.
    ApiToken {
        token: String,
        machine_id: String,
        #[serde(default)]
        ghost_mode: bool,
    },
    // Copilot-style long-lived token from which short-lived bearers are minted.
    Minted {
        long_lived: String,
        #[serde(default)]
        short_lived: Option<String>,
        #[serde(default)]
        short_lived_expires_at: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Available,
    Cooling,
    Invalid,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(rename = "addedAt")]
    pub added_at: DateTime<Utc>,
    #[serde(rename = "lastUsed", default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "isInvalid", default)]
    pub is_invalid: bool,
    #[serde(rename = "invalidReason", default)]
    pub invalid_reason: Option<String>,
    #[serde(rename = "cooldownUntil", default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    // In-memory tracker state; never persisted.
    #[serde(skip)]
    pub trackers: TrackerState,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn new(id: String, email: Option<String>, credentials: Credentials) -> Self {
        Self {
            id,
            email,
            credentials,
            added_at: Utc::now(),
            last_used: None,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            cooldown_until: None,
            trackers: TrackerState::default(),
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> AccountState {
        if !self.enabled {
            return AccountState::Disabled;
        }
        if self.is_invalid {
            return AccountState::Invalid;
        }
        match self.cooldown_until {
            Some(until) if until > now => AccountState::Cooling,
            _ => AccountState::Available,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == AccountState::Available
    }

    // Remaining cooldown in milliseconds, 0 when not cooling.
    pub fn cooldown_remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        match self.cooldown_until {
            Some(until) if until > now => (until - now).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn oauth_account(id: &str) -> Account {
        Account::new(
            id.to_string(),
            Some(format!("{}@example.com", id)),
            Credentials::OAuth {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now().timestamp() + 3600,
            },
        )
    }

    #[test]
    fn fresh_account_is_available() {
        let account = oauth_account("a1");
        assert_eq!(account.state(Utc::now()), AccountState::Available);
    }

    #[test]
    fn cooling_transitions_back_after_deadline() {
        let mut account = oauth_account("a1");
        let now = Utc::now();
        account.cooldown_until = Some(now + Duration::seconds(10));
        assert_eq!(account.state(now), AccountState::Cooling);
        assert!(account.cooldown_remaining_ms(now) > 9_000);
        assert_eq!(
            account.state(now + Duration::seconds(11)),
            AccountState::Available
        );
    }

    #[test]
    fn invalid_wins_over_cooldown() {
        let mut account = oauth_account("a1");
        account.is_invalid = true;
        account.cooldown_until = Some(Utc::now() + Duration::seconds(10));
        assert_eq!(account.state(Utc::now()), AccountState::Invalid);
    }

    #[test]
    fn credentials_round_trip_with_kind_tag() {
        let account = oauth_account("a1");
        let raw = serde_json::to_value(&account).unwrap();
        assert_eq!(raw["kind"], "oauth");
        let back: Account = serde_json::from_value(raw).unwrap();
        assert!(matches!(back.credentials, Credentials::OAuth { .. }));
    }
}
