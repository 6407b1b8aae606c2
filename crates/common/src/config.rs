//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Channel gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Queue configuration.
    #[serde(default)]
    pub queues: QueueSettings,
    /// Circuit breaker configuration.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Rate limit tier configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Connection health supervisor configuration.
    #[serde(default)]
    pub health: HealthSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// External chat network gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the channel provider API.
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
    /// Reconnect behaviour for dropped sessions.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            timeout_secs: default_gateway_timeout(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Reconnect backoff settings for channel sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    /// Maximum reconnect attempts before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the backoff delay in milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            multiplier: default_reconnect_multiplier(),
        }
    }
}

impl ReconnectSettings {
    /// Backoff delay for the given attempt number (0-indexed), capped at
    /// `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Retention rule for terminal jobs: whichever of count and age binds first.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Retention {
    /// Keep at most this many jobs.
    pub count: u64,
    /// Keep jobs at most this many hours.
    pub age_hours: u64,
}

impl Retention {
    /// Maximum age as a [`Duration`].
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.age_hours * 3600)
    }
}

/// Per-queue tuning: priority, retries, backoff, concurrency, retention.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueTuning {
    /// Default job priority. Lower values are served first.
    pub priority: u8,
    /// Maximum delivery attempts before dead-lettering.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Number of concurrent executors in the worker pool.
    pub concurrency: usize,
    /// Retention for completed jobs.
    pub completed: Retention,
    /// Retention for failed jobs (kept longer for diagnostics).
    pub failed: Retention,
}

/// Queue system configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Real-time inbound message queue (highest priority).
    #[serde(default = "default_message_tuning")]
    pub messages: QueueTuning,
    /// Scheduled automation queue (medium priority).
    #[serde(default = "default_automation_tuning")]
    pub automations: QueueTuning,
    /// Bulk campaign queue (lowest priority).
    #[serde(default = "default_campaign_tuning")]
    pub campaigns: QueueTuning,
    /// Worker poll interval when the queue is empty, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Job lease duration in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// How many times a stalled job may be re-delivered before dead-lettering.
    #[serde(default = "default_max_stalled")]
    pub max_stalled: u32,
    /// Delay before re-checking an unavailable channel, in seconds.
    #[serde(default = "default_channel_recheck_secs")]
    pub channel_recheck_secs: u64,
    /// Pacing delay between campaign recipients, in milliseconds.
    #[serde(default = "default_campaign_pace_ms")]
    pub campaign_pace_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            messages: default_message_tuning(),
            automations: default_automation_tuning(),
            campaigns: default_campaign_tuning(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            max_stalled: default_max_stalled(),
            channel_recheck_secs: default_channel_recheck_secs(),
            campaign_pace_ms: default_campaign_pace_ms(),
        }
    }
}

impl QueueSettings {
    /// Job lease duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Worker poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Half-open successes before the breaker closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Cool-down before an open breaker admits a probe, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Unconditional reset after this long in a failing state, in seconds.
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_secs: default_cooldown_secs(),
            reset_window_secs: default_reset_window_secs(),
        }
    }
}

impl BreakerSettings {
    /// Cool-down duration before a probe is admitted.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Hard reset window.
    #[must_use]
    pub const fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }
}

/// A single rate limit tier: fixed window length and request maximum.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierSettings {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Maximum requests per window.
    pub max_requests: u32,
}

impl TierSettings {
    /// Create a tier setting.
    #[must_use]
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            window_secs,
            max_requests,
        }
    }

    /// Window length as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate limit tiers, keyed by endpoint criticality.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Critical mutating operations.
    #[serde(default = "default_critical_tier")]
    pub critical: TierSettings,
    /// Standard CRUD operations.
    #[serde(default = "default_standard_tier")]
    pub standard: TierSettings,
    /// Read-heavy / analytics operations.
    #[serde(default = "default_read_tier")]
    pub read: TierSettings,
    /// Realtime channel connection attempts.
    #[serde(default = "default_realtime_tier")]
    pub realtime: TierSettings,
    /// Authentication attempts, keyed by submitted identity.
    #[serde(default = "default_auth_tier")]
    pub auth: TierSettings,
    /// Inbound third-party webhooks.
    #[serde(default = "default_webhook_tier")]
    pub webhook: TierSettings,
    /// Catch-all for uncategorized routes.
    #[serde(default = "default_global_tier")]
    pub global: TierSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            critical: default_critical_tier(),
            standard: default_standard_tier(),
            read: default_read_tier(),
            realtime: default_realtime_tier(),
            auth: default_auth_tier(),
            webhook: default_webhook_tier(),
            global: default_global_tier(),
        }
    }
}

/// Connection health supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    /// Interval between periodic health passes, in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Reconnect attempts before an instance is marked failed.
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap: u32,
    /// Session artifacts inactive longer than this are deleted, in days.
    #[serde(default = "default_session_max_age_days")]
    pub session_max_age_days: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            reconnect_cap: default_reconnect_cap(),
            session_max_age_days: default_session_max_age_days(),
        }
    }
}

impl HealthSettings {
    /// Interval between periodic passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Maximum session artifact age before cleanup.
    #[must_use]
    pub const fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_days * 24 * 3600)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_redis_prefix() -> String {
    "courier".to_string()
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8900".to_string()
}

const fn default_gateway_timeout() -> u64 {
    30
}

const fn default_reconnect_attempts() -> u32 {
    10
}

const fn default_reconnect_base_ms() -> u64 {
    5000
}

const fn default_reconnect_max_ms() -> u64 {
    60_000
}

const fn default_reconnect_multiplier() -> f64 {
    1.5
}

fn default_message_tuning() -> QueueTuning {
    QueueTuning {
        priority: 1,
        max_attempts: 3,
        backoff_base_ms: 2000,
        concurrency: 5,
        completed: Retention {
            count: 100,
            age_hours: 24,
        },
        failed: Retention {
            count: 500,
            age_hours: 7 * 24,
        },
    }
}

fn default_automation_tuning() -> QueueTuning {
    QueueTuning {
        priority: 3,
        max_attempts: 2,
        backoff_base_ms: 2000,
        concurrency: 3,
        completed: Retention {
            count: 75,
            age_hours: 24,
        },
        failed: Retention {
            count: 300,
            age_hours: 7 * 24,
        },
    }
}

fn default_campaign_tuning() -> QueueTuning {
    QueueTuning {
        priority: 5,
        max_attempts: 2,
        backoff_base_ms: 5000,
        concurrency: 3,
        completed: Retention {
            count: 50,
            age_hours: 48,
        },
        failed: Retention {
            count: 200,
            age_hours: 7 * 24,
        },
    }
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_lease_secs() -> u64 {
    30
}

const fn default_max_stalled() -> u32 {
    1
}

const fn default_channel_recheck_secs() -> u64 {
    60
}

const fn default_campaign_pace_ms() -> u64 {
    600
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_cooldown_secs() -> u64 {
    60
}

const fn default_reset_window_secs() -> u64 {
    300
}

const fn default_critical_tier() -> TierSettings {
    TierSettings::new(10, 60)
}

const fn default_standard_tier() -> TierSettings {
    TierSettings::new(60, 60)
}

const fn default_read_tier() -> TierSettings {
    TierSettings::new(120, 60)
}

const fn default_realtime_tier() -> TierSettings {
    TierSettings::new(100, 300)
}

const fn default_auth_tier() -> TierSettings {
    TierSettings::new(50, 900)
}

const fn default_webhook_tier() -> TierSettings {
    TierSettings::new(300, 60)
}

const fn default_global_tier() -> TierSettings {
    TierSettings::new(100, 900)
}

const fn default_health_interval_secs() -> u64 {
    300
}

const fn default_reconnect_cap() -> u32 {
    10
}

const fn default_session_max_age_days() -> u64 {
    30
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `COURIER_ENV`)
    /// 3. Environment variables with `COURIER_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
