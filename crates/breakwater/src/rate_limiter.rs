//! Refill-based rate limiter with timed waiting
//!
//! Dispenses `limit_for_period` permits every `limit_refresh_period`. The
//! entire limiter state lives in one `AtomicU64` word packing the active
//! cycle number with the permits remaining in that cycle; acquisition is a
//! compare-and-swap loop with no locks. Permits may go negative: a negative
//! count encodes reservations taken out against upcoming cycles by callers
//! who agreed to wait. Multiple waiters therefore each reserve distinct
//! permits; once a full cycle's worth of reservations is outstanding, later
//! callers wait for a further cycle or time out.
//!
//! Waiting parks on the tokio timer (async) or the calling thread (blocking),
//! never longer than the configured timeout. Cancelling a parked waiter
//! returns its reserved permit best-effort.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, PolicyError, PolicyResult, RequestNotPermitted};
use crate::events::{EventBus, EventKind};

const PERMIT_BITS: u32 = 24;
const PERMIT_MASK: u64 = (1 << PERMIT_BITS) - 1;

/// Largest `limit_for_period` representable in the packed state word
pub const MAX_LIMIT_FOR_PERIOD: u32 = (1 << 22) - 1;

fn pack(cycle: u64, permits: i32) -> u64 {
    (cycle << PERMIT_BITS) | (u64::from(permits as u32) & PERMIT_MASK)
}

fn unpack(word: u64) -> (u64, i32) {
    let cycle = word >> PERMIT_BITS;
    let raw = (word & PERMIT_MASK) as u32;
    // Sign-extend the 24-bit permit field.
    let permits = ((raw << 8) as i32) >> 8;
    (cycle, permits)
}

/// Configuration for rate limiter behavior
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Permits dispensed per refresh cycle
    pub limit_for_period: u32,
    /// Length of one refresh cycle
    pub limit_refresh_period: Duration,
    /// Maximum time a caller may wait for a permit
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_millis(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::invalid("limit_for_period must be greater than 0"));
        }
        if self.limit_for_period > MAX_LIMIT_FOR_PERIOD {
            return Err(ConfigError::invalid(format!(
                "limit_for_period must not exceed {MAX_LIMIT_FOR_PERIOD}"
            )));
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::invalid("limit_refresh_period must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`RateLimiterConfig`]
#[derive(Debug)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl Default for RateLimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Rate limiter metrics for monitoring
#[derive(Debug, Clone)]
pub struct RateLimiterMetrics {
    /// Permits still available in the current cycle
    pub available_permits: u32,
    /// Active cycle number since creation
    pub cycle: u64,
    pub granted_calls: u64,
    pub denied_calls: u64,
}

struct LimiterShared {
    name: String,
    config: RateLimiterConfig,
    state: AtomicU64,
    start: Instant,
    clock: Arc<dyn Clock>,
    events: EventBus,
    granted: AtomicU64,
    denied: AtomicU64,
}

impl LimiterShared {
    fn period_nanos(&self) -> u64 {
        self.config.limit_refresh_period.as_nanos() as u64
    }

    fn now_nanos(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.start).as_nanos() as u64
    }

    /// Refill `permits` for the cycles that passed since `cycle`.
    fn refill(&self, permits: i32, cycles_passed: u64) -> i32 {
        let limit = i64::from(self.config.limit_for_period);
        let deficit = limit - i64::from(permits);
        if (cycles_passed as i64).saturating_mul(limit) >= deficit {
            limit as i32
        } else {
            (i64::from(permits) + cycles_passed as i64 * limit) as i32
        }
    }

    /// Claim one permit, waiting at most `timeout`. Returns how long the
    /// caller must park before the claim becomes valid.
    fn try_reserve(&self, timeout: Duration) -> Result<Duration, RequestNotPermitted> {
        let limit = self.config.limit_for_period;
        let period = self.period_nanos();
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (cycle, permits) = unpack(word);
            let now = self.now_nanos();
            let current_cycle = now / period;

            let effective = if current_cycle > cycle {
                self.refill(permits, current_cycle - cycle)
            } else {
                permits
            };

            let new_permits = effective - 1;
            let wait_nanos = if new_permits >= 0 {
                0
            } else {
                let deficit = u64::from(new_permits.unsigned_abs());
                let cycles_to_wait = deficit.div_ceil(u64::from(limit));
                (current_cycle + cycles_to_wait).saturating_mul(period).saturating_sub(now)
            };

            if u128::from(wait_nanos) > timeout.as_nanos() {
                debug!(limiter = %self.name, "Rate limiter denying request, wait exceeds timeout");
                return Err(RequestNotPermitted { name: self.name.clone(), timeout });
            }

            let next = pack(current_cycle, new_permits);
            if self
                .state
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Duration::from_nanos(wait_nanos));
            }
        }
    }

    /// Best-effort return of one reserved permit, capped at the cycle limit.
    fn return_permit(&self) {
        let limit = self.config.limit_for_period as i32;
        let returned = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let (cycle, permits) = unpack(word);
            (permits < limit).then(|| pack(cycle, permits + 1))
        });
        if returned.is_err() {
            warn!(limiter = %self.name, "Could not return cancelled reservation");
        }
    }

    fn granted(&self, waited: Duration) {
        self.granted.fetch_add(1, Ordering::Relaxed);
        self.events.publish(EventKind::AcquireGranted { waited });
    }

    fn denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        self.events.publish(EventKind::AcquireDenied);
    }
}

/// Returns a cancelled waiter's reservation unless disarmed after the park.
struct Reservation {
    shared: Arc<LimiterShared>,
    active: bool,
}

impl Reservation {
    fn disarm(mut self) {
        self.active = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            self.shared.return_permit();
        }
    }
}

/// Named rate limiter instance
///
/// Clones share the same underlying state.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use breakwater::{RateLimiter, RateLimiterConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RateLimiterConfig::builder()
///     .limit_for_period(10)
///     .limit_refresh_period(Duration::from_secs(1))
///     .timeout_duration(Duration::from_millis(100))
///     .build()?;
/// let limiter = RateLimiter::new("outbound", config)?;
///
/// limiter.acquire().await?;
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter {
    inner: Arc<LimiterShared>,
}

impl RateLimiter {
    /// Create a limiter with the system clock.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a limiter with a custom clock (useful for testing).
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: impl Clock + 'static,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let clock: Arc<dyn Clock> = Arc::new(clock);
        Ok(Self {
            inner: Arc::new(LimiterShared {
                state: AtomicU64::new(pack(0, i32::try_from(config.limit_for_period).unwrap_or(0))),
                start: clock.now(),
                events: EventBus::new(name.clone(), Arc::clone(&clock)),
                granted: AtomicU64::new(0),
                denied: AtomicU64::new(0),
                clock,
                name,
                config,
            }),
        })
    }

    /// Create a limiter with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RateLimiterConfig::default()).expect("Default config should be valid")
    }

    /// Create a configuration builder.
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Name of this instance.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The instance's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Claim a permit without waiting.
    pub fn try_acquire(&self) -> Result<(), RequestNotPermitted> {
        match self.inner.try_reserve(Duration::ZERO) {
            Ok(_) => {
                self.inner.granted(Duration::ZERO);
                Ok(())
            }
            Err(rejection) => {
                self.inner.denied();
                Err(rejection)
            }
        }
    }

    /// Claim a permit, parking on the tokio timer up to the configured
    /// timeout. Dropping the future while parked returns the reservation
    /// best-effort.
    pub async fn acquire(&self) -> Result<(), RequestNotPermitted> {
        match self.inner.try_reserve(self.inner.config.timeout_duration) {
            Ok(wait) => {
                if !wait.is_zero() {
                    let reservation =
                        Reservation { shared: Arc::clone(&self.inner), active: true };
                    tokio::time::sleep(wait).await;
                    reservation.disarm();
                }
                self.inner.granted(wait);
                Ok(())
            }
            Err(rejection) => {
                self.inner.denied();
                Err(rejection)
            }
        }
    }

    /// Claim a permit, blocking the calling thread up to the configured
    /// timeout.
    pub fn acquire_blocking(&self) -> Result<(), RequestNotPermitted> {
        match self.inner.try_reserve(self.inner.config.timeout_duration) {
            Ok(wait) => {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                self.inner.granted(wait);
                Ok(())
            }
            Err(rejection) => {
                self.inner.denied();
                Err(rejection)
            }
        }
    }

    /// Execute a synchronous operation under the rate limit.
    #[instrument(skip(self, operation), fields(limiter = %self.name()))]
    pub fn call<F, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire_blocking()?;
        operation().map_err(|error| PolicyError::OperationFailed { source: error })
    }

    /// Execute an async operation under the rate limit.
    #[instrument(skip(self, operation), fields(limiter = %self.name()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire().await?;
        operation().await.map_err(|error| PolicyError::OperationFailed { source: error })
    }

    /// Permits still available in the current cycle.
    pub fn available_permits(&self) -> u32 {
        let (cycle, permits) = unpack(self.inner.state.load(Ordering::Acquire));
        let current_cycle = self.inner.now_nanos() / self.inner.period_nanos();
        let effective = if current_cycle > cycle {
            self.inner.refill(permits, current_cycle - cycle)
        } else {
            permits
        };
        effective.max(0) as u32
    }

    /// Snapshot of the limiter state and counters.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let (cycle, _) = unpack(self.inner.state.load(Ordering::Acquire));
        RateLimiterMetrics {
            available_permits: self.available_permits(),
            cycle,
            granted_calls: self.inner.granted.load(Ordering::Acquire),
            denied_calls: self.inner.denied.load(Ordering::Acquire),
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("available_permits", &self.available_permits())
            .finish()
    }
}
