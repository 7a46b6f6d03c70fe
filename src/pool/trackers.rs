// Per-account statistics with time-based recovery. All trackers take an
// explicit `now_ms` so recovery math is deterministic under test.

const HOUR_MS: i64 = 3_600_000;
const MINUTE_MS: i64 = 60_000;

pub const HEALTH_INITIAL: f64 = 70.0;
pub const HEALTH_MIN_USABLE: f64 = 50.0;
const HEALTH_MAX: f64 = 100.0;
const HEALTH_RECOVERY_PER_HOUR: f64 = 10.0;

pub const BUCKET_CAPACITY: f64 = 50.0;
const BUCKET_REFILL_PER_MINUTE: f64 = 6.0;

pub const QUOTA_LOW: f64 = 0.10;
pub const QUOTA_CRITICAL: f64 = 0.05;
const QUOTA_STALE_MS: i64 = 5 * MINUTE_MS;

#[derive(Debug, Clone)]
pub struct HealthTracker {
    score: f64,
    last_touch_ms: i64,
}

impl HealthTracker {
    pub fn new(now_ms: i64) -> Self {
        Self {
            score: HEALTH_INITIAL,
            last_touch_ms: now_ms,
        }
    }

    // Score with passive recovery applied: +10 per full hour since last touch.
    pub fn current(&self, now_ms: i64) -> f64 {
        let hours = (now_ms - self.last_touch_ms).max(0) / HOUR_MS;
        (self.score + hours as f64 * HEALTH_RECOVERY_PER_HOUR).clamp(0.0, HEALTH_MAX)
    }

    pub fn is_usable(&self, now_ms: i64) -> bool {
        self.current(now_ms) >= HEALTH_MIN_USABLE
    }

    fn settle(&mut self, now_ms: i64) {
        self.score = self.current(now_ms);
        self.last_touch_ms = now_ms;
    }

    pub fn record_success(&mut self, now_ms: i64) {
        self.settle(now_ms);
        self.score = (self.score + 1.0).min(HEALTH_MAX);
    }

    pub fn record_rate_limit(&mut self, now_ms: i64) {
        self.settle(now_ms);
        self.score = (self.score - 10.0).max(0.0);
    }

    pub fn record_failure(&mut self, now_ms: i64) {
        self.settle(now_ms);
        self.score = (self.score - 20.0).max(0.0);
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    level: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    pub fn new(now_ms: i64) -> Self {
        Self {
            level: BUCKET_CAPACITY,
            last_refill_ms: now_ms,
        }
    }

    pub fn level(&self, now_ms: i64) -> f64 {
        let elapsed_min = (now_ms - self.last_refill_ms).max(0) as f64 / MINUTE_MS as f64;
        (self.level + elapsed_min * BUCKET_REFILL_PER_MINUTE).min(BUCKET_CAPACITY)
    }

    pub fn has_token(&self, now_ms: i64) -> bool {
        self.level(now_ms) >= 1.0
    }

    fn settle(&mut self, now_ms: i64) {
        self.level = self.level(now_ms);
        self.last_refill_ms = now_ms;
    }

    // Atomic with selection: caller holds the pool lock.
    pub fn consume(&mut self, now_ms: i64) -> bool {
        self.settle(now_ms);
        if self.level < 1.0 {
            return false;
        }
        self.level -= 1.0;
        true
    }

    pub fn refund(&mut self, now_ms: i64) {
        self.settle(now_ms);
        self.level = (self.level + 1.0).min(BUCKET_CAPACITY);
    }

    // Milliseconds until one full token is available; 0 when already there.
    pub fn time_to_next_token_ms(&self, now_ms: i64) -> u64 {
        let level = self.level(now_ms);
        if level >= 1.0 {
            return 0;
        }
        let missing = 1.0 - level;
        (missing / BUCKET_REFILL_PER_MINUTE * MINUTE_MS as f64).ceil() as u64
    }
}

#[derive(Debug, Clone)]
struct QuotaSample {
    fraction: f64,
    updated_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    per_model: std::collections::HashMap<String, QuotaSample>,
}

impl QuotaTracker {
    // Last observed free fraction for the model, or None when never seen or
    // stale beyond the freshness horizon.
    pub fn fraction(&self, model: &str, now_ms: i64) -> Option<f64> {
        let sample = self.per_model.get(model)?;
        if now_ms - sample.updated_ms > QUOTA_STALE_MS {
            return None;
        }
        Some(sample.fraction)
    }

    // Scoring contribution in [0, 100]; unknown quota scores the midpoint.
    pub fn score(&self, model: &str, now_ms: i64) -> f64 {
        match self.fraction(model, now_ms) {
            Some(q) => 100.0 * q,
            None => 50.0,
        }
    }

    pub fn is_ok(&self, model: &str, now_ms: i64) -> bool {
        match self.fraction(model, now_ms) {
            Some(q) => q > QUOTA_CRITICAL,
            None => true,
        }
    }

    pub fn update(&mut self, model: &str, fraction: f64, now_ms: i64) {
        self.per_model.insert(
            model.to_string(),
            QuotaSample {
                fraction: fraction.clamp(0.0, 1.0),
                updated_ms: now_ms,
            },
        );
    }

    // Heuristic decay for backends without quota telemetry: a 429 halves the
    // last known fraction (treating unknown as full).
    pub fn decay_on_rate_limit(&mut self, model: &str, now_ms: i64) {
        let current = self.fraction(model, now_ms).unwrap_or(1.0);
        self.update(model, current / 2.0, now_ms);
    }
}

#[derive(Debug, Clone)]
pub struct TrackerState {
    pub health: HealthTracker,
    pub bucket: TokenBucket,
    pub quota: QuotaTracker,
}

impl TrackerState {
    pub fn new(now_ms: i64) -> Self {
        Self {
            health: HealthTracker::new(now_ms),
            bucket: TokenBucket::new(now_ms),
            quota: QuotaTracker::default(),
        }
    }
}

impl Default for TrackerState {
    fn default() -> Self {
        Self::new(chrono::Utc::now().timestamp_millis())
    }
}
