//! Externally-supplied configuration blocks
//!
//! Serde-deserializable settings for each policy kind, keyed by policy name.
//! Settings carry only data: thresholds, durations (serialized as
//! milliseconds), window shapes. Error and result classification predicates
//! are programmatic-only and are set on the builders directly; a settings
//! block converts into a validated runtime config via `TryFrom`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::{BackoffStrategy, Jitter, RetryConfig};
use crate::window::WindowKind;

/// Serde helpers for `Duration` as integer milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Window eviction scheme as it appears in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    Count,
    Time,
}

impl From<WindowType> for WindowKind {
    fn from(value: WindowType) -> Self {
        match value {
            WindowType::Count => WindowKind::CountBased,
            WindowType::Time => WindowKind::TimeBased,
        }
    }
}

/// Circuit breaker settings block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    #[serde(with = "duration_millis")]
    pub slow_call_duration_threshold: Duration,
    pub permitted_calls_in_half_open: u32,
    pub sliding_window_type: WindowType,
    pub sliding_window_size: usize,
    pub minimum_calls: u64,
    #[serde(with = "duration_millis")]
    pub wait_in_open: Duration,
    pub automatic_half_open: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_rate_threshold: defaults.failure_rate_threshold,
            slow_call_rate_threshold: defaults.slow_call_rate_threshold,
            slow_call_duration_threshold: defaults.slow_call_duration_threshold,
            permitted_calls_in_half_open: defaults.permitted_calls_in_half_open,
            sliding_window_type: WindowType::Count,
            sliding_window_size: defaults.window_size,
            minimum_calls: defaults.minimum_calls,
            wait_in_open: defaults.wait_in_open,
            automatic_half_open: defaults.automatic_half_open,
        }
    }
}

impl TryFrom<CircuitBreakerSettings> for CircuitBreakerConfig {
    type Error = ConfigError;

    fn try_from(settings: CircuitBreakerSettings) -> ConfigResult<Self> {
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(settings.failure_rate_threshold)
            .slow_call_rate_threshold(settings.slow_call_rate_threshold)
            .slow_call_duration_threshold(settings.slow_call_duration_threshold)
            .permitted_calls_in_half_open(settings.permitted_calls_in_half_open)
            .sliding_window(settings.sliding_window_type.into(), settings.sliding_window_size)
            .minimum_calls(settings.minimum_calls)
            .wait_in_open(settings.wait_in_open)
            .automatic_half_open(settings.automatic_half_open)
            .build()
    }
}

/// Rate limiter settings block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub limit_for_period: u32,
    #[serde(with = "duration_millis")]
    pub limit_refresh_period: Duration,
    #[serde(with = "duration_millis")]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            limit_for_period: defaults.limit_for_period,
            limit_refresh_period: defaults.limit_refresh_period,
            timeout_duration: defaults.timeout_duration,
        }
    }
}

impl TryFrom<RateLimiterSettings> for RateLimiterConfig {
    type Error = ConfigError;

    fn try_from(settings: RateLimiterSettings) -> ConfigResult<Self> {
        RateLimiterConfig::builder()
            .limit_for_period(settings.limit_for_period)
            .limit_refresh_period(settings.limit_refresh_period)
            .timeout_duration(settings.timeout_duration)
            .build()
    }
}

/// Bulkhead settings block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    pub max_concurrent: usize,
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        let defaults = BulkheadConfig::default();
        Self { max_concurrent: defaults.max_concurrent, max_wait: defaults.max_wait }
    }
}

impl TryFrom<BulkheadSettings> for BulkheadConfig {
    type Error = ConfigError;

    fn try_from(settings: BulkheadSettings) -> ConfigResult<Self> {
        BulkheadConfig::builder()
            .max_concurrent(settings.max_concurrent)
            .max_wait(settings.max_wait)
            .build()
    }
}

/// Backoff strategy as it appears in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffSettings {
    Fixed {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
    Linear {
        #[serde(with = "duration_millis")]
        initial: Duration,
        #[serde(with = "duration_millis")]
        increment: Duration,
    },
    Exponential {
        #[serde(with = "duration_millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
    Randomized {
        #[serde(with = "duration_millis")]
        base: Duration,
        factor: f64,
    },
}

impl From<BackoffSettings> for BackoffStrategy {
    fn from(value: BackoffSettings) -> Self {
        match value {
            BackoffSettings::Fixed { delay } => BackoffStrategy::Fixed(delay),
            BackoffSettings::Linear { initial, increment } => {
                BackoffStrategy::Linear { initial, increment }
            }
            BackoffSettings::Exponential { initial, multiplier, max } => {
                BackoffStrategy::Exponential { initial, multiplier, max }
            }
            BackoffSettings::Randomized { base, factor } => {
                BackoffStrategy::Randomized { base, factor }
            }
        }
    }
}

/// Jitter as it appears in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterSettings {
    None,
    Full,
    Equal,
}

impl From<JitterSettings> for Jitter {
    fn from(value: JitterSettings) -> Self {
        match value {
            JitterSettings::None => Jitter::None,
            JitterSettings::Full => Jitter::Full,
            JitterSettings::Equal => Jitter::Equal,
        }
    }
}

/// Retry settings block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    pub jitter: JitterSettings,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffSettings::Fixed { delay: Duration::from_millis(500) },
            jitter: JitterSettings::None,
        }
    }
}

impl TryFrom<RetrySettings> for RetryConfig {
    type Error = ConfigError;

    fn try_from(settings: RetrySettings) -> ConfigResult<Self> {
        let config = RetryConfig {
            max_attempts: settings.max_attempts,
            backoff: settings.backoff.into(),
            jitter: settings.jitter.into(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Typed settings blocks per policy kind, keyed by policy name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub circuit_breakers: HashMap<String, CircuitBreakerSettings>,
    pub rate_limiters: HashMap<String, RateLimiterSettings>,
    pub bulkheads: HashMap<String, BulkheadSettings>,
    pub retries: HashMap<String, RetrySettings>,
}

impl PolicySettings {
    /// Resolve the circuit breaker config for `name`, if a block exists.
    pub fn circuit_breaker(&self, name: &str) -> Option<ConfigResult<CircuitBreakerConfig>> {
        self.circuit_breakers.get(name).map(|s| s.clone().try_into())
    }

    /// Resolve the rate limiter config for `name`, if a block exists.
    pub fn rate_limiter(&self, name: &str) -> Option<ConfigResult<RateLimiterConfig>> {
        self.rate_limiters.get(name).map(|s| s.clone().try_into())
    }

    /// Resolve the bulkhead config for `name`, if a block exists.
    pub fn bulkhead(&self, name: &str) -> Option<ConfigResult<BulkheadConfig>> {
        self.bulkheads.get(name).map(|s| s.clone().try_into())
    }

    /// Resolve the retry config for `name`, if a block exists.
    pub fn retry(&self, name: &str) -> Option<ConfigResult<RetryConfig>> {
        self.retries.get(name).map(|s| s.clone().try_into())
    }
}
