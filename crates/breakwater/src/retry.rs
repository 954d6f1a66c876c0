//! Bounded re-execution with configurable backoff
//!
//! A [`Retry`] instance re-invokes a failing operation until it succeeds, the
//! attempt budget runs out, or the retry policy declines. The interval
//! between attempts is a pure function of the 1-based attempt number
//! ([`BackoffStrategy`]), optionally randomized further by [`Jitter`]. Async
//! waits park on the tokio timer so no worker thread blocks, and dropping the
//! outer future cancels both the pending wait and the in-flight attempt.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, PolicyError, PolicyResult};
use crate::events::{EventBus, EventKind};

/// Generate a pseudo-random value below `max` from a timing-based seed.
/// Good enough distribution for jitter without an external dependency.
fn pseudo_random(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = u64::from(Instant::now().elapsed().subsec_nanos());
    // Linear congruential generator, constants from Numerical Recipes.
    let mut seed = nanos.wrapping_mul(1664525).wrapping_add(1013904223);
    seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
    seed % max
}

/// Backoff strategy for calculating retry intervals
///
/// The interval function receives the 1-based number of the attempt that just
/// failed.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed interval between retries
    Fixed(Duration),
    /// Linear backoff: `initial + increment * (attempt - 1)`
    Linear { initial: Duration, increment: Duration },
    /// Exponential backoff: `initial * multiplier^(attempt - 1)`, capped
    Exponential { initial: Duration, multiplier: f64, max: Duration },
    /// Base interval scaled by a uniform factor in `[1 - factor, 1 + factor]`
    Randomized { base: Duration, factor: f64 },
    /// Custom interval function
    Custom(fn(u32) -> Duration),
}

impl BackoffStrategy {
    /// Interval to wait after the given 1-based attempt failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial, increment } => {
                *initial + increment.saturating_mul(attempt - 1)
            }
            BackoffStrategy::Exponential { initial, multiplier, max } => {
                let delay =
                    initial.as_millis() as f64 * multiplier.powi(attempt as i32 - 1);
                let delay_ms = delay.min(max.as_millis() as f64) as u64;
                Duration::from_millis(delay_ms)
            }
            BackoffStrategy::Randomized { base, factor } => {
                let base_ms = base.as_millis() as f64;
                let spread = (2.0 * factor * base_ms) as u64;
                let low = (base_ms * (1.0 - factor)).max(0.0) as u64;
                Duration::from_millis(low + pseudo_random(spread.max(1)))
            }
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

/// Jitter applied on top of the calculated backoff interval
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Full jitter: uniform in `[0, delay]`
    Full,
    /// Equal jitter: uniform in `[delay/2, delay]`
    Equal,
}

impl Jitter {
    /// Apply jitter to the calculated interval.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(pseudo_random(delay.as_millis() as u64 + 1)),
            Jitter::Equal => {
                let half = delay.as_millis() as u64 / 2;
                Duration::from_millis(half + pseudo_random(half + 1))
            }
        }
    }
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry with the configured backoff interval
    Retry,
    /// Retry after a custom interval
    RetryAfter(Duration),
    /// Don't retry; propagate the error unchanged
    Stop,
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide for the error produced by the given 1-based attempt.
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - propagates the first error
    #[derive(Debug, Clone)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempt budget, including the first call
    pub max_attempts: u32,
    /// Interval function
    pub backoff: BackoffStrategy,
    /// Randomization applied on top of the interval
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Fixed(Duration::from_millis(500)),
            jitter: Jitter::None,
        }
    }
}

impl RetryConfig {
    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        match &self.backoff {
            BackoffStrategy::Exponential { multiplier, .. } if *multiplier <= 0.0 => {
                Err(ConfigError::invalid("exponential multiplier must be greater than 0"))
            }
            BackoffStrategy::Randomized { factor, .. } if !(0.0..=1.0).contains(factor) => {
                Err(ConfigError::invalid("randomization factor must be in [0, 1]"))
            }
            _ => Ok(()),
        }
    }
}

/// Builder for [`RetryConfig`] with fluent API
#[derive(Debug)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn linear_backoff(mut self, initial: Duration, increment: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Linear { initial, increment };
        self
    }

    pub fn exponential_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { initial, multiplier, max };
        self
    }

    pub fn randomized_backoff(mut self, base: Duration, factor: f64) -> Self {
        self.config.backoff = BackoffStrategy::Randomized { base, factor };
        self
    }

    pub fn custom_backoff(mut self, f: fn(u32) -> Duration) -> Self {
        self.config.backoff = BackoffStrategy::Custom(f);
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    pub fn full_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Full;
        self
    }

    pub fn equal_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Equal;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Aggregate retry counters for monitoring
#[derive(Debug, Clone)]
pub struct RetryMetrics {
    pub calls: u64,
    pub succeeded_without_retry: u64,
    pub succeeded_after_retry: u64,
    pub failed_without_retry: u64,
    pub failed_after_retry: u64,
}

pub(crate) struct RetryShared {
    pub(crate) name: String,
    pub(crate) config: RetryConfig,
    pub(crate) events: EventBus,
    pub(crate) calls: AtomicU64,
    pub(crate) succeeded_without_retry: AtomicU64,
    pub(crate) succeeded_after_retry: AtomicU64,
    pub(crate) failed_without_retry: AtomicU64,
    pub(crate) failed_after_retry: AtomicU64,
}

impl RetryShared {
    pub(crate) fn interval(&self, attempt: u32) -> Duration {
        self.config.jitter.apply(self.config.backoff.delay_for(attempt))
    }

    pub(crate) fn record_success(&self, attempts: u32) {
        if attempts == 1 {
            self.succeeded_without_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            self.succeeded_after_retry.fetch_add(1, Ordering::Relaxed);
            self.events.publish(EventKind::RetrySucceeded { attempts });
            debug!(retry = %self.name, attempts, "Operation succeeded after retries");
        }
    }

    pub(crate) fn record_failure(&self, attempts: u32) {
        if attempts == 1 {
            self.failed_without_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_after_retry.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Named retry instance
///
/// Clones share the same counters and event bus.
///
/// # Examples
///
/// ```rust
/// use breakwater::retry::policies;
/// use breakwater::{Retry, RetryConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RetryConfig::builder()
///     .max_attempts(5)
///     .exponential_backoff(
///         std::time::Duration::from_millis(100),
///         2.0,
///         std::time::Duration::from_secs(30),
///     )
///     .full_jitter()
///     .build()?;
/// let retry = Retry::new("flaky-backend", config)?;
///
/// let value = retry
///     .execute(policies::AlwaysRetry, || async { Ok::<_, std::io::Error>(42) })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Retry {
    pub(crate) inner: Arc<RetryShared>,
}

impl Retry {
    /// Create a retry instance with the system clock for event timestamps.
    pub fn new(name: impl Into<String>, config: RetryConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a retry instance with a custom clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: RetryConfig,
        clock: impl Clock + 'static,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let clock: Arc<dyn Clock> = Arc::new(clock);
        Ok(Self {
            inner: Arc::new(RetryShared {
                events: EventBus::new(name.clone(), clock),
                calls: AtomicU64::new(0),
                succeeded_without_retry: AtomicU64::new(0),
                succeeded_after_retry: AtomicU64::new(0),
                failed_without_retry: AtomicU64::new(0),
                failed_after_retry: AtomicU64::new(0),
                name,
                config,
            }),
        })
    }

    /// Create a retry instance with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RetryConfig::default()).expect("Default config should be valid")
    }

    /// Create a configuration builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Name of this instance.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The instance's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Execute an async operation, retrying per the policy.
    #[instrument(skip(self, policy, operation), fields(retry = %self.name()))]
    pub async fn execute<P, F, Fut, T, E>(&self, policy: P, operation: F) -> PolicyResult<T, E>
    where
        P: RetryPolicy<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_classified(policy, |_: &T| false, operation).await
    }

    /// Like [`execute`](Self::execute), additionally treating successful
    /// values matching `retry_on_result` as retryable.
    pub async fn execute_classified<P, R, F, Fut, T, E>(
        &self,
        policy: P,
        retry_on_result: R,
        mut operation: F,
    ) -> PolicyResult<T, E>
    where
        P: RetryPolicy<E>,
        R: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.inner.config.max_attempts;
        let mut attempt = 1u32;

        loop {
            match operation().await {
                Ok(value) => {
                    if retry_on_result(&value) && attempt < max_attempts {
                        let wait = self.inner.interval(attempt);
                        self.inner.events.publish(EventKind::RetryScheduled { attempt, wait });
                        debug!(retry = %self.name(), attempt, ?wait, "Result classified as retryable");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    self.inner.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        self.inner.record_failure(attempt);
                        warn!(
                            retry = %self.name(),
                            attempts = attempt,
                            "All retry attempts exhausted"
                        );
                        self.inner.events.publish(EventKind::RetryExhausted {
                            attempts: attempt,
                            error: error.to_string(),
                        });
                        return Err(PolicyError::RetriesExhausted { attempts: attempt, source: error });
                    }
                    let wait = match policy.should_retry(&error, attempt) {
                        RetryDecision::Stop => {
                            self.inner.record_failure(attempt);
                            self.inner
                                .events
                                .publish(EventKind::RetryErrorIgnored { error: error.to_string() });
                            debug!(retry = %self.name(), "Policy declined to retry");
                            return Err(PolicyError::OperationFailed { source: error });
                        }
                        RetryDecision::Retry => self.inner.interval(attempt),
                        RetryDecision::RetryAfter(custom) => custom,
                    };
                    self.inner.events.publish(EventKind::RetryScheduled { attempt, wait });
                    warn!(retry = %self.name(), attempt, ?wait, "Operation failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Execute a synchronous operation, retrying per the policy. Waits block
    /// the calling thread.
    #[instrument(skip(self, policy, operation), fields(retry = %self.name()))]
    pub fn call<P, F, T, E>(&self, policy: P, operation: F) -> PolicyResult<T, E>
    where
        P: RetryPolicy<E>,
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.call_classified(policy, |_: &T| false, operation)
    }

    /// Like [`call`](Self::call) with result classification.
    pub fn call_classified<P, R, F, T, E>(
        &self,
        policy: P,
        retry_on_result: R,
        mut operation: F,
    ) -> PolicyResult<T, E>
    where
        P: RetryPolicy<E>,
        R: Fn(&T) -> bool,
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.inner.config.max_attempts;
        let mut attempt = 1u32;

        loop {
            match operation() {
                Ok(value) => {
                    if retry_on_result(&value) && attempt < max_attempts {
                        let wait = self.inner.interval(attempt);
                        self.inner.events.publish(EventKind::RetryScheduled { attempt, wait });
                        std::thread::sleep(wait);
                        attempt += 1;
                        continue;
                    }
                    self.inner.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        self.inner.record_failure(attempt);
                        self.inner.events.publish(EventKind::RetryExhausted {
                            attempts: attempt,
                            error: error.to_string(),
                        });
                        return Err(PolicyError::RetriesExhausted { attempts: attempt, source: error });
                    }
                    let wait = match policy.should_retry(&error, attempt) {
                        RetryDecision::Stop => {
                            self.inner.record_failure(attempt);
                            self.inner
                                .events
                                .publish(EventKind::RetryErrorIgnored { error: error.to_string() });
                            return Err(PolicyError::OperationFailed { source: error });
                        }
                        RetryDecision::Retry => self.inner.interval(attempt),
                        RetryDecision::RetryAfter(custom) => custom,
                    };
                    self.inner.events.publish(EventKind::RetryScheduled { attempt, wait });
                    std::thread::sleep(wait);
                    attempt += 1;
                }
            }
        }
    }

    /// Snapshot of the aggregate counters.
    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            calls: self.inner.calls.load(Ordering::Acquire),
            succeeded_without_retry: self.inner.succeeded_without_retry.load(Ordering::Acquire),
            succeeded_after_retry: self.inner.succeeded_after_retry.load(Ordering::Acquire),
            failed_without_retry: self.inner.failed_without_retry.load(Ordering::Acquire),
            failed_after_retry: self.inner.failed_after_retry.load(Ordering::Acquire),
        }
    }
}

impl Clone for Retry {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("max_attempts", &self.inner.config.max_attempts)
            .finish()
    }
}
