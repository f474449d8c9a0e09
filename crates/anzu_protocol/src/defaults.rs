//! Canonical default values shared across the workspace.

// ── Control plane ──────────────────────────────────────────────────────

pub const DEFAULT_CONTROL_ADDR: &str = "tcp://127.0.0.1:5655";
pub const DEFAULT_DB_URL: &str = "sqlite:anzu.db?mode=rwc";

// ── External backends ──────────────────────────────────────────────────

pub const DEFAULT_IMAGE_BACKEND_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_LLM_URL: &str = "http://127.0.0.1:8090";
pub const DEFAULT_INFERENCE_URL: &str = "http://127.0.0.1:11434";

// ── Orchestrator ───────────────────────────────────────────────────────

/// Seconds between tick-loop passes.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
/// Approved images needed to advance past `training_data`.
pub const DEFAULT_TRAINING_TARGET: i64 = 30;
/// `blocked_reason` / error strings are truncated to this length.
pub const MAX_REASON_LEN: usize = 500;
/// Project rows block on characters with this reason string.
pub const BLOCKED_ON_CHARACTERS: &str = "Waiting for all character LoRAs";

// ── Learning ───────────────────────────────────────────────────────────

/// Minimum generations before suggest_params trusts the history.
pub const MIN_SAMPLES: i64 = 5;
/// Quality threshold for a "successful" generation in suggest_params.
pub const SUCCESS_THRESHOLD: f64 = 0.7;
/// Quality floor for recommend_params sampling.
pub const QUALITY_FLOOR: f64 = 0.65;
/// Minimum data points before recommendations carry any confidence.
pub const MIN_CONFIDENCE_SAMPLES: i64 = 5;
/// Alert when a character's rolling average drops below this.
pub const DRIFT_ALERT_THRESHOLD: f64 = 0.55;
/// Generations considered "recent" by drift detection.
pub const DRIFT_WINDOW: i64 = 20;
/// Recent average must drop this far below overall to count as drift.
pub const DRIFT_DELTA: f64 = 0.10;
/// A rejection category must appear this often to contribute negatives.
pub const NEGATIVE_MIN_FREQUENCY: i64 = 2;
/// Aggregations look back this many days unless stated otherwise.
pub const LEARNING_LOOKBACK_DAYS: i64 = 30;

// ── Quality gates ──────────────────────────────────────────────────────

pub const DEFAULT_AUTO_REJECT_THRESHOLD: f64 = 0.4;
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 0.8;

// ── Replenishment ──────────────────────────────────────────────────────

/// Approved-image pool target per character.
pub const DEFAULT_REPLENISH_TARGET: i64 = 20;
/// Seconds between replenishment passes.
pub const DEFAULT_REPLENISH_INTERVAL_SECS: u64 = 600;
/// Generations allowed per character per day.
pub const DEFAULT_DAILY_GENERATION_CAP: i64 = 40;
/// Consecutive rejections before a character is paused.
pub const DEFAULT_REJECTION_STREAK_LIMIT: i64 = 3;
/// Pause cooldown in seconds (2 hours).
pub const DEFAULT_PAUSE_COOLDOWN_SECS: i64 = 7_200;

// ── Auto-correction ────────────────────────────────────────────────────

/// Never auto-correct deeper than this many correction-of hops.
pub const CORRECTION_DEPTH_LIMIT: i64 = 3;
/// Deterministic seed offset applied to corrected generations.
pub const CORRECTION_SEED_OFFSET: i64 = 101;

// ── Circuit breaker & retry ────────────────────────────────────────────

/// Consecutive failures before a breaker opens.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
/// Seconds an open breaker waits before probing half-open.
pub const CIRCUIT_RECOVERY_SECS: u64 = 60;
/// Base delay for exponential retry backoff (seconds).
pub const RETRY_BASE_SECS: u64 = 1;
/// Backoff ceiling (seconds).
pub const RETRY_MAX_DELAY_SECS: u64 = 60;
/// Attempts after the first call.
pub const MAX_RETRIES: u32 = 3;

// ── Image backend monitoring ───────────────────────────────────────────

/// Seconds between status polls while a job runs.
pub const POLL_INTERVAL_SECS: u64 = 3;
/// A non-queued job with no progress for this long is stuck.
pub const STUCK_AFTER_SECS: u64 = 300;
/// Overall per-request wall-clock deadline (seconds).
pub const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 600;

// ── GPU router ─────────────────────────────────────────────────────────

/// Minimum free VRAM (MB) for generation-accelerator admission.
pub const MIN_FREE_VRAM_MB: i64 = 4_500;
/// Wait after a free-memory request before re-querying VRAM (seconds).
pub const VRAM_RECHECK_DELAY_SECS: u64 = 2;

// ── LLM adapter ────────────────────────────────────────────────────────

/// Response-cache TTL (seconds).
pub const DEFAULT_LLM_CACHE_TTL_SECS: u64 = 3_600;
/// Rolling per-model stats window (calls).
pub const MODEL_STATS_WINDOW: usize = 100;
/// Models below this success rate are excluded from selection.
pub const MODEL_MIN_SUCCESS_RATE: f64 = 0.70;
/// Exclusion only applies once a model has this many recorded calls.
pub const MODEL_MIN_CALLS: usize = 3;

// ── Store ──────────────────────────────────────────────────────────────

/// Character -> project map cache TTL (seconds).
pub const CHAR_CACHE_TTL_SECS: i64 = 60;
pub const DB_MIN_CONNECTIONS: u32 = 2;
pub const DB_MAX_CONNECTIONS: u32 = 10;

// ── Security ───────────────────────────────────────────────────────────

/// Requests per minute per authenticated subject.
pub const RATE_LIMIT_PER_MINUTE: u32 = 60;
