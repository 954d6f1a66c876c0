//! Bulkhead pattern for limiting concurrent operations
//!
//! Counting-semaphore semantics over `max_concurrent` permits, with an
//! optional bounded wait for a free slot. The returned [`BulkheadPermit`] is
//! a scoped acquisition wrapper: whatever exit path the protected call takes
//! (return, error, panic unwind, or future cancellation), dropping the permit
//! releases the slot and publishes the completion event exactly once, so
//! crashed callers can never leak capacity.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::{BulkheadFull, ConfigError, ConfigResult, PolicyError, PolicyResult};
use crate::events::{EventBus, EventKind};

/// Configuration for bulkhead behavior
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent calls allowed
    pub max_concurrent: usize,
    /// How long an acquisition may wait for a free slot; zero rejects
    /// immediately when saturated
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 25, max_wait: Duration::ZERO }
    }
}

impl BulkheadConfig {
    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid("max_concurrent exceeds supported permit count"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`]
#[derive(Debug)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl Default for BulkheadConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait = wait;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Bulkhead metrics for monitoring
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Permits currently free, always within `[0, max_concurrent]`
    pub available_permits: usize,
    /// Calls currently holding a permit
    pub current_concurrent: usize,
    pub max_concurrent: usize,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

impl BulkheadMetrics {
    /// Current utilization as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.available_permits == 0
    }
}

struct BulkheadShared {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    events: EventBus,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl BulkheadShared {
    fn reject(&self) -> BulkheadFull {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        self.events.publish(EventKind::CallRejected);
        debug!(bulkhead = %self.name, "Bulkhead rejected call");
        BulkheadFull { name: self.name.clone(), capacity: self.config.max_concurrent }
    }

    fn permitted(
        shared: &Arc<Self>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> BulkheadPermit {
        shared.total_calls.fetch_add(1, Ordering::Relaxed);
        shared.events.publish(EventKind::CallPermitted);
        BulkheadPermit { _permit: permit, shared: Arc::clone(shared) }
    }
}

/// Scoped permit that releases its bulkhead slot on every exit path
///
/// Dropping the permit returns the slot and publishes the completion event
/// exactly once.
pub struct BulkheadPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    shared: Arc<BulkheadShared>,
}

impl BulkheadPermit {
    /// Explicitly finish the protected call (equivalent to dropping).
    pub fn complete(self) {}
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.shared.events.publish(EventKind::CallFinished);
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("bulkhead", &self.shared.name).finish()
    }
}

/// Named bulkhead instance
///
/// Clones share the same underlying permit pool.
///
/// # Examples
///
/// ```rust
/// use breakwater::{Bulkhead, BulkheadConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BulkheadConfig::builder().max_concurrent(5).build()?;
/// let bulkhead = Bulkhead::new("db", config)?;
///
/// let result = bulkhead.execute(|| async { Ok::<_, std::io::Error>("ok") }).await?;
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    inner: Arc<BulkheadShared>,
}

impl Bulkhead {
    /// Create a bulkhead with the given configuration.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a bulkhead with a custom clock for event timestamps.
    pub fn with_clock(
        name: impl Into<String>,
        config: BulkheadConfig,
        clock: impl Clock + 'static,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let clock: Arc<dyn Clock> = Arc::new(clock);
        Ok(Self {
            inner: Arc::new(BulkheadShared {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                events: EventBus::new(name.clone(), clock),
                total_calls: AtomicU64::new(0),
                rejected_calls: AtomicU64::new(0),
                name,
                config,
            }),
        })
    }

    /// Create a bulkhead with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BulkheadConfig::default()).expect("Default config should be valid")
    }

    /// Create a configuration builder.
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Name of this instance.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The instance's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Claim a slot without waiting.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(BulkheadShared::permitted(&self.inner, permit)),
            Err(_) => Err(self.inner.reject()),
        }
    }

    /// Claim a slot, waiting up to the configured `max_wait`.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        if self.inner.config.max_wait.is_zero() {
            return self.try_acquire();
        }
        let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
        match tokio::time::timeout(self.inner.config.max_wait, acquire).await {
            Ok(Ok(permit)) => Ok(BulkheadShared::permitted(&self.inner, permit)),
            // Closed semaphore cannot happen: the bulkhead never closes it.
            Ok(Err(_)) | Err(_) => Err(self.inner.reject()),
        }
    }

    /// Execute a synchronous operation inside the bulkhead.
    #[instrument(skip(self, operation), fields(bulkhead = %self.name()))]
    pub fn call<F, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire()?;
        let result = operation().map_err(|error| PolicyError::OperationFailed { source: error });
        permit.complete();
        result
    }

    /// Execute an async operation inside the bulkhead.
    ///
    /// The permit is held across the await; cancellation of the returned
    /// future releases it.
    #[instrument(skip(self, operation), fields(bulkhead = %self.name()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.acquire().await?;
        let result =
            operation().await.map_err(|error| PolicyError::OperationFailed { source: error });
        permit.complete();
        result
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Snapshot of permits and counters.
    pub fn metrics(&self) -> BulkheadMetrics {
        let available = self.available_permits();
        BulkheadMetrics {
            available_permits: available,
            current_concurrent: self.inner.config.max_concurrent.saturating_sub(available),
            max_concurrent: self.inner.config.max_concurrent,
            total_calls: self.inner.total_calls.load(Ordering::Acquire),
            rejected_calls: self.inner.rejected_calls.load(Ordering::Acquire),
        }
    }
}

impl Clone for Bulkhead {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.config.max_concurrent)
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent(0).build().is_err());
        assert!(BulkheadConfig::builder().max_concurrent(1).build().is_ok());
    }

    #[test]
    fn test_reject_when_full_and_recover_on_release() {
        let config = BulkheadConfig::builder().max_concurrent(2).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let p1 = bulkhead.try_acquire().expect("first slot");
        let p2 = bulkhead.try_acquire().expect("second slot");
        assert!(bulkhead.try_acquire().is_err(), "third call rejected");

        drop(p1);
        assert!(bulkhead.try_acquire().is_ok(), "slot freed by completion");
        drop(p2);
    }

    #[test]
    fn test_available_permits_stays_in_bounds() {
        let config = BulkheadConfig::builder().max_concurrent(2).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        assert_eq!(bulkhead.available_permits(), 2);
        let p1 = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.available_permits(), 1);
        let p2 = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.available_permits(), 0);
        let _ = bulkhead.try_acquire();
        assert_eq!(bulkhead.available_permits(), 0);

        drop(p1);
        drop(p2);
        assert_eq!(bulkhead.available_permits(), 2);
    }

    #[test]
    fn test_events_for_lifecycle() {
        let bulkhead = Bulkhead::with_defaults("test");

        let permit = bulkhead.try_acquire().unwrap();
        drop(permit);

        let history = bulkhead.events().history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::CallPermitted);
        assert_eq!(history[1].kind, EventKind::CallFinished);
    }

    #[test]
    fn test_finished_event_exactly_once() {
        let bulkhead = Bulkhead::with_defaults("test");
        let permit = bulkhead.try_acquire().unwrap();
        permit.complete();

        let finished = bulkhead
            .events()
            .history_filtered(|k| matches!(k, EventKind::CallFinished));
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn test_permit_released_on_panic() {
        let bulkhead = Bulkhead::with_defaults("test");
        let captured = bulkhead.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = captured.try_acquire().unwrap();
            panic!("intentional panic while holding a permit");
        }));
        assert!(result.is_err());
        assert_eq!(bulkhead.available_permits(), bulkhead.metrics().max_concurrent);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .max_wait(Duration::from_millis(200))
            .build()
            .unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let permit = bulkhead.acquire().await.unwrap();
        let contender = bulkhead.clone();
        let waiter = tokio::spawn(async move { contender.acquire().await.is_ok() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        assert!(waiter.await.unwrap(), "waiter admitted after release");
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .max_wait(Duration::from_millis(30))
            .build()
            .unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let _held = bulkhead.acquire().await.unwrap();
        let rejected = bulkhead.acquire().await;
        assert!(rejected.is_err(), "wait budget exhausted");
        assert_eq!(bulkhead.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_execute_limits_concurrency() {
        let config = BulkheadConfig::builder().max_concurrent(2).build().unwrap();
        let bulkhead = Arc::new(Bulkhead::new("test", config).unwrap());
        let peak = Arc::new(AtomicU32::new(0));
        let active = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bulkhead = Arc::clone(&bulkhead);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let peak = Arc::clone(&peak);
                        let active = Arc::clone(&active);
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, std::io::Error>(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "never more than max_concurrent in flight");
        let metrics = bulkhead.metrics();
        assert!(metrics.rejected_calls > 0, "overflow calls were rejected");
        assert_eq!(bulkhead.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_execute_releases_permit() {
        let config = BulkheadConfig::builder().max_concurrent(1).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let captured = bulkhead.clone();
        let task = tokio::spawn(async move {
            captured
                .execute(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, std::io::Error>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(bulkhead.available_permits(), 1, "cancellation returned the permit");
        let finished = bulkhead
            .events()
            .history_filtered(|k| matches!(k, EventKind::CallFinished));
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn test_metrics_utilization() {
        let config = BulkheadConfig::builder().max_concurrent(4).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let _p1 = bulkhead.try_acquire().unwrap();
        let _p2 = bulkhead.try_acquire().unwrap();

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.current_concurrent, 2);
        assert_eq!(metrics.utilization(), 0.5);
        assert!(!metrics.is_at_capacity());
    }
}
