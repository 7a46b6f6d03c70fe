// Hybrid selection: graded predicate cascade, then composite scoring over the
// first non-empty level. The caller (the pool) holds the lock, so consuming a
// token here is atomic with the pick.

use chrono::{DateTime, Utc};

use crate::models::Account;
use crate::pool::trackers::BUCKET_CAPACITY;

const SCORE_WEIGHT_HEALTH: f64 = 2.0;
const SCORE_WEIGHT_TOKENS: f64 = 5.0;
const SCORE_WEIGHT_QUOTA: f64 = 3.0;
const SCORE_WEIGHT_LRU: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterLevel {
    Strict,
    IgnoreHealth,
    IgnoreTokens,
    LastResort,
}

impl FilterLevel {
    pub const ALL: [FilterLevel; 4] = [
        FilterLevel::Strict,
        FilterLevel::IgnoreHealth,
        FilterLevel::IgnoreTokens,
        FilterLevel::LastResort,
    ];

    pub fn matches(self, account: &Account, model: &str, now: DateTime<Utc>, now_ms: i64) -> bool {
        let active = account.is_available(now);
        let healthy = account.trackers.health.is_usable(now_ms);
        let has_token = account.trackers.bucket.has_token(now_ms);
        let quota_ok = account.trackers.quota.is_ok(model, now_ms);
        match self {
            FilterLevel::Strict => active && healthy && has_token && quota_ok,
            FilterLevel::IgnoreHealth => active && has_token && quota_ok,
            FilterLevel::IgnoreTokens => active && healthy && quota_ok,
            FilterLevel::LastResort => active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Picked {
        index: usize,
        level: FilterLevel,
        score: f64,
    },
    Wait {
        wait_ms: u64,
    },
    // No enabled, non-invalid account exists; waiting cannot help and only
    // operator action (or adding accounts) recovers the pool.
    Unrecoverable,
}

fn lru_score(account: &Account, now: DateTime<Utc>) -> f64 {
    match account.last_used {
        Some(last) => {
            let minutes = (now - last).num_milliseconds().max(0) as f64 / 60_000.0;
            minutes.min(100.0)
        }
        None => 100.0,
    }
}

pub fn composite_score(account: &Account, model: &str, now: DateTime<Utc>, now_ms: i64) -> f64 {
    let health = account.trackers.health.current(now_ms);
    let bucket = account.trackers.bucket.level(now_ms);
    let quota = account.trackers.quota.score(model, now_ms);
    SCORE_WEIGHT_HEALTH * health
        + SCORE_WEIGHT_TOKENS * (100.0 * bucket / BUCKET_CAPACITY)
        + SCORE_WEIGHT_QUOTA * quota
        + SCORE_WEIGHT_LRU * lru_score(account, now)
}

// Shortest wait until any account becomes usable again: cooling accounts by
// remaining cooldown, token-starved active accounts by refill time.
fn shortest_wait_ms(accounts: &[Account], now: DateTime<Utc>, now_ms: i64, default_ms: u64) -> u64 {
    let mut best: Option<u64> = None;
    for account in accounts {
        if !account.enabled || account.is_invalid {
            continue;
        }
        let wait = if account.is_available(now) {
            account.trackers.bucket.time_to_next_token_ms(now_ms)
        } else {
            account.cooldown_remaining_ms(now)
        };
        if wait > 0 {
            best = Some(best.map_or(wait, |b| b.min(wait)));
        }
    }
    best.unwrap_or(default_ms).max(1)
}

// Pick one account or report how long to wait. The returned index always
// satisfies the predicate of the level it was found at; the pick only stands
// when a pacing token could actually be consumed, so concurrent selectors
// never oversubscribe the buckets.
pub fn pick(
    accounts: &mut [Account],
    active_index: usize,
    model: &str,
    now: DateTime<Utc>,
    default_wait_ms: u64,
) -> Selection {
    let now_ms = now.timestamp_millis();
    let n = accounts.len();
    if !accounts.iter().any(|a| a.enabled && !a.is_invalid) {
        return Selection::Unrecoverable;
    }

    for level in FilterLevel::ALL {
        let mut winner: Option<(usize, f64)> = None;
        for offset in 0..n {
            let pos = (active_index + offset) % n;
            if !level.matches(&accounts[pos], model, now, now_ms) {
                continue;
            }
            let score = composite_score(&accounts[pos], model, now, now_ms);
            // Strictly-greater keeps the rotation anchor on ties.
            match winner {
                Some((_, best)) if score <= best => {}
                _ => winner = Some((pos, score)),
            }
        }

        if let Some((index, score)) = winner {
            if accounts[index].trackers.bucket.consume(now_ms) {
                accounts[index].last_used = Some(now);
                return Selection::Picked {
                    index,
                    level,
                    score,
                };
            }
            // The level admitted a token-less account; report the refill wait
            // instead of bursting past the pacing limit.
            return Selection::Wait {
                wait_ms: shortest_wait_ms(accounts, now, now_ms, default_wait_ms),
            };
        }
    }

    Selection::Wait {
        wait_ms: shortest_wait_ms(accounts, now, now_ms, default_wait_ms),
    }
}
