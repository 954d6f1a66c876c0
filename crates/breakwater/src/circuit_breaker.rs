//! Circuit breaker over a sliding outcome window
//!
//! The breaker prevents cascading failures by tracking the failure and
//! slow-call rates of recent calls and refusing new calls while a protected
//! dependency is unhealthy. Five states: `Closed` (normal operation), `Open`
//! (rejecting), `HalfOpen` (limited trial calls), plus the manually-driven
//! `Disabled` and `ForcedOpen`.
//!
//! The hot path is lock-free: the current state and a monotonic generation
//! counter share one atomic word, and transitions are compare-and-set keyed
//! on the generation. A losing CAS means another thread already effected the
//! transition and the loser simply re-reads. Every permit holds the
//! generation it was issued under, so an outcome reported after a transition
//! lands in the window of the epoch that permitted the call, never the
//! current one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{CallNotPermitted, ConfigError, ConfigResult, PolicyError, PolicyResult};
use crate::events::{EventBus, EventKind};
use crate::window::{Outcome, OutcomeWindow, WindowKind, WindowSnapshot};

/// Type-erased predicate over the error of a wrapped operation
pub type ErrorPredicate =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool + Send + Sync>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Permitting calls, outcomes feed the closed-state window
    Closed,
    /// Rejecting calls until the open-state wait elapses
    Open,
    /// Permitting a bounded number of trial calls
    HalfOpen,
    /// Always permitting, recording nothing; left only by explicit command
    Disabled,
    /// Always rejecting; left only by explicit command
    ForcedOpen,
}

impl CircuitState {
    fn ordinal(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
            CircuitState::Disabled => 3,
            CircuitState::ForcedOpen => 4,
        }
    }

    fn from_ordinal(ordinal: u64) -> Self {
        match ordinal {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            3 => CircuitState::Disabled,
            _ => CircuitState::ForcedOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::Disabled => write!(f, "DISABLED"),
            CircuitState::ForcedOpen => write!(f, "FORCED_OPEN"),
        }
    }
}

const STATE_BITS: u32 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack_state(state: CircuitState, generation: u64) -> u64 {
    (generation << STATE_BITS) | state.ordinal()
}

fn unpack_state(word: u64) -> (CircuitState, u64) {
    (CircuitState::from_ordinal(word & STATE_MASK), word >> STATE_BITS)
}

/// Configuration for circuit breaker behavior
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failure-rate percentage at or above which the circuit opens
    pub failure_rate_threshold: f32,
    /// Slow-call-rate percentage at or above which the circuit opens
    pub slow_call_rate_threshold: f32,
    /// Duration above which a call counts as slow
    pub slow_call_duration_threshold: Duration,
    /// Number of trial calls permitted while half-open
    pub permitted_calls_in_half_open: u32,
    /// Eviction scheme of the closed-state window
    pub window_kind: WindowKind,
    /// Window size: outcome count (count-based) or seconds (time-based)
    pub window_size: usize,
    /// Outcomes required before rates become actionable
    pub minimum_calls: u64,
    /// Time to stay open before trial calls are allowed
    pub wait_in_open: Duration,
    /// Schedule the open-to-half-open transition instead of waiting for the
    /// next acquisition attempt
    pub automatic_half_open: bool,
    /// Errors for which this predicate returns false bypass the window
    pub record_error: ErrorPredicate,
    /// Errors for which this predicate returns true bypass the window even
    /// when `record_error` matched
    pub ignore_error: ErrorPredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            permitted_calls_in_half_open: 10,
            window_kind: WindowKind::CountBased,
            window_size: 100,
            minimum_calls: 100,
            wait_in_open: Duration::from_secs(60),
            automatic_half_open: false,
            record_error: Arc::new(|_| true),
            ignore_error: Arc::new(|_| false),
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("permitted_calls_in_half_open", &self.permitted_calls_in_half_open)
            .field("window_kind", &self.window_kind)
            .field("window_size", &self.window_size)
            .field("minimum_calls", &self.minimum_calls)
            .field("wait_in_open", &self.wait_in_open)
            .field("automatic_half_open", &self.automatic_half_open)
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::invalid("failure_rate_threshold must be in (0, 100]"));
        }
        if !(self.slow_call_rate_threshold > 0.0 && self.slow_call_rate_threshold <= 100.0) {
            return Err(ConfigError::invalid("slow_call_rate_threshold must be in (0, 100]"));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(ConfigError::invalid("permitted_calls_in_half_open must be greater than 0"));
        }
        if self.window_size == 0 {
            return Err(ConfigError::invalid("window_size must be greater than 0"));
        }
        if self.minimum_calls == 0 {
            return Err(ConfigError::invalid("minimum_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    pub fn sliding_window(mut self, kind: WindowKind, size: usize) -> Self {
        self.config.window_kind = kind;
        self.config.window_size = size;
        self
    }

    pub fn minimum_calls(mut self, calls: u64) -> Self {
        self.config.minimum_calls = calls;
        self
    }

    pub fn wait_in_open(mut self, wait: Duration) -> Self {
        self.config.wait_in_open = wait;
        self
    }

    pub fn automatic_half_open(mut self, automatic: bool) -> Self {
        self.config.automatic_half_open = automatic;
        self
    }

    /// Record an error into the window only when the predicate matches.
    pub fn record_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.config.record_error = Arc::new(predicate);
        self
    }

    /// Bypass the window for errors matching the predicate.
    pub fn ignore_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.config.ignore_error = Arc::new(predicate);
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One state epoch: everything outcome reports may touch after a transition
struct Generation {
    number: u64,
    state: CircuitState,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    trial_calls: AtomicU32,
}

struct BreakerShared {
    name: String,
    config: CircuitBreakerConfig,
    state_word: AtomicU64,
    current: RwLock<Arc<Generation>>,
    events: EventBus,
    rejected_calls: AtomicU64,
    clock: Arc<dyn Clock>,
    open_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BreakerShared {
    fn current_generation(&self) -> Arc<Generation> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                warn!(breaker = %self.name, "Circuit breaker generation lock poisoned");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    fn new_window_for(&self, state: CircuitState, now: Instant) -> OutcomeWindow {
        match state {
            CircuitState::Closed => match self.config.window_kind {
                WindowKind::CountBased => {
                    OutcomeWindow::count_based(self.config.window_size, self.config.minimum_calls)
                }
                WindowKind::TimeBased => OutcomeWindow::time_based(
                    self.config.window_size,
                    self.config.minimum_calls,
                    now,
                ),
            },
            CircuitState::HalfOpen => OutcomeWindow::count_based(
                self.config.permitted_calls_in_half_open as usize,
                u64::from(self.config.permitted_calls_in_half_open),
            ),
            // Non-recording states; the window is never consulted.
            _ => OutcomeWindow::count_based(1, u64::MAX),
        }
    }

    fn reject(&self) -> CallNotPermitted {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        self.events.publish(EventKind::CallNotPermitted);
        debug!(breaker = %self.name, "Circuit breaker rejecting call");
        CallNotPermitted { name: self.name.clone() }
    }

    /// Attempt the transition from `(from, from_generation)` to `to`. A false
    /// return means another thread won the race and the caller must re-read.
    fn try_transition(
        shared: &Arc<Self>,
        from_generation: u64,
        from: CircuitState,
        to: CircuitState,
    ) -> bool {
        let old_word = pack_state(from, from_generation);
        let next = from_generation + 1;
        let new_word = pack_state(to, next);
        if shared
            .state_word
            .compare_exchange(old_word, new_word, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let now = shared.clock.now();
        let generation = Arc::new(Generation {
            number: next,
            state: to,
            window: shared.new_window_for(to, now),
            opened_at: (to == CircuitState::Open).then_some(now),
            trial_calls: AtomicU32::new(0),
        });
        match shared.current.write() {
            Ok(mut guard) => *guard = generation,
            Err(poisoned) => *poisoned.into_inner() = generation,
        }

        if from != to {
            info!(breaker = %shared.name, %from, %to, "Circuit breaker state transition");
            shared.events.publish(EventKind::StateTransition { from, to, generation: next });
        }
        Self::manage_open_task(shared, to, next);
        true
    }

    fn manage_open_task(shared: &Arc<Self>, to: CircuitState, generation: u64) {
        let Ok(mut slot) = shared.open_task.lock() else { return };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        if to != CircuitState::Open || !shared.config.automatic_half_open {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(breaker = %shared.name, "No tokio runtime; open-to-half-open stays lazy");
            return;
        }
        let weak = Arc::downgrade(shared);
        let wait = shared.config.wait_in_open;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(shared) = weak.upgrade() {
                BreakerShared::try_transition(
                    &shared,
                    generation,
                    CircuitState::Open,
                    CircuitState::HalfOpen,
                );
            }
        }));
    }

    fn on_success(shared: &Arc<Self>, generation: &Arc<Generation>, duration: Duration) {
        shared.events.publish(EventKind::CallSucceeded { duration });
        if generation.state == CircuitState::Disabled {
            return;
        }
        let outcome = if duration > shared.config.slow_call_duration_threshold {
            Outcome::SlowSuccess(duration)
        } else {
            Outcome::Success(duration)
        };
        generation.window.record(outcome, shared.clock.now());
        Self::evaluate(shared, generation);
    }

    fn on_failure(
        shared: &Arc<Self>,
        generation: &Arc<Generation>,
        duration: Duration,
        error: String,
    ) {
        shared.events.publish(EventKind::CallFailed { duration, error });
        if generation.state == CircuitState::Disabled {
            return;
        }
        let outcome = if duration > shared.config.slow_call_duration_threshold {
            Outcome::SlowFailure(duration)
        } else {
            Outcome::Failure(duration)
        };
        generation.window.record(outcome, shared.clock.now());
        Self::evaluate(shared, generation);
    }

    fn on_error(
        shared: &Arc<Self>,
        generation: &Arc<Generation>,
        duration: Duration,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        let recorded =
            (shared.config.record_error)(error) && !(shared.config.ignore_error)(error);
        if !recorded {
            shared.events.publish(EventKind::ErrorIgnored { error: error.to_string() });
            shared.release_trial(generation);
            return;
        }
        Self::on_failure(shared, generation, duration, error.to_string());
    }

    /// Hand back a half-open trial slot that produced no recordable outcome.
    fn release_trial(&self, generation: &Generation) {
        if generation.state == CircuitState::HalfOpen {
            let _ = generation.trial_calls.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |calls| calls.checked_sub(1),
            );
        }
    }

    fn evaluate(shared: &Arc<Self>, generation: &Arc<Generation>) {
        let snapshot = generation.window.snapshot(shared.clock.now());
        if !snapshot.saturated {
            return;
        }
        let failure_breach = snapshot.failure_rate >= shared.config.failure_rate_threshold;
        let slow_breach = snapshot.slow_call_rate >= shared.config.slow_call_rate_threshold;

        match generation.state {
            CircuitState::Closed => {
                if failure_breach || slow_breach {
                    if failure_breach {
                        warn!(
                            breaker = %shared.name,
                            rate = snapshot.failure_rate,
                            "Failure rate threshold exceeded"
                        );
                        shared
                            .events
                            .publish(EventKind::FailureRateExceeded { rate: snapshot.failure_rate });
                    }
                    if slow_breach {
                        warn!(
                            breaker = %shared.name,
                            rate = snapshot.slow_call_rate,
                            "Slow call rate threshold exceeded"
                        );
                        shared.events.publish(EventKind::SlowCallRateExceeded {
                            rate: snapshot.slow_call_rate,
                        });
                    }
                    Self::try_transition(
                        shared,
                        generation.number,
                        CircuitState::Closed,
                        CircuitState::Open,
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Saturation of the half-open window means the trial budget
                // has produced its verdict.
                let to = if failure_breach || slow_breach {
                    CircuitState::Open
                } else {
                    CircuitState::Closed
                };
                Self::try_transition(shared, generation.number, CircuitState::HalfOpen, to);
            }
            _ => {}
        }
    }
}

/// The right to run one protected call
///
/// Consume it with exactly one of [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure),
/// [`record_error`](Self::record_error), or [`cancel`](Self::cancel).
/// Dropping an unconsumed permit counts as cancellation, so a half-open trial
/// slot can never leak.
pub struct CircuitPermit {
    shared: Arc<BreakerShared>,
    generation: Arc<Generation>,
    done: bool,
}

impl CircuitPermit {
    /// Report a successful call of the given duration.
    pub fn record_success(mut self, duration: Duration) {
        self.done = true;
        BreakerShared::on_success(&self.shared, &self.generation, duration);
    }

    /// Report a call whose successful value was classified as a failure.
    pub fn record_failure(mut self, duration: Duration) {
        self.done = true;
        BreakerShared::on_failure(
            &self.shared,
            &self.generation,
            duration,
            "result classified as failure".to_string(),
        );
    }

    /// Report a failed call; the configured predicates decide whether the
    /// error feeds the window or is ignored.
    pub fn record_error(
        mut self,
        duration: Duration,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        self.done = true;
        BreakerShared::on_error(&self.shared, &self.generation, duration, error);
    }

    /// Release the permission without reporting an outcome.
    pub fn cancel(mut self) {
        self.done = true;
        self.shared.release_trial(&self.generation);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.done {
            self.shared.release_trial(&self.generation);
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.shared.name)
            .field("generation", &self.generation.number)
            .finish()
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub generation: u64,
    pub window: WindowSnapshot,
    pub rejected_calls: u64,
}

/// Named circuit breaker instance
///
/// Clones share the same underlying state, so a breaker can be handed to any
/// number of tasks.
///
/// # Examples
///
/// ```rust
/// use breakwater::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CircuitBreakerConfig::builder()
///     .failure_rate_threshold(50.0)
///     .minimum_calls(10)
///     .build()?;
/// let breaker = CircuitBreaker::new("backend", config)?;
///
/// let value = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker {
    inner: Arc<BreakerShared>,
}

impl CircuitBreaker {
    /// Create a breaker with the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a breaker with a custom clock (useful for testing).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: impl Clock + 'static,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let events = EventBus::new(name.clone(), Arc::clone(&clock));
        let now = clock.now();

        let window = match config.window_kind {
            WindowKind::CountBased => {
                OutcomeWindow::count_based(config.window_size, config.minimum_calls)
            }
            WindowKind::TimeBased => {
                OutcomeWindow::time_based(config.window_size, config.minimum_calls, now)
            }
        };
        let generation = Arc::new(Generation {
            number: 0,
            state: CircuitState::Closed,
            window,
            opened_at: None,
            trial_calls: AtomicU32::new(0),
        });

        Ok(Self {
            inner: Arc::new(BreakerShared {
                state_word: AtomicU64::new(pack_state(CircuitState::Closed, 0)),
                current: RwLock::new(generation),
                events,
                rejected_calls: AtomicU64::new(0),
                clock,
                open_task: Mutex::new(None),
                name,
                config,
            }),
        })
    }

    /// Create a breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default()).expect("Default config should be valid")
    }

    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Name of this instance.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The instance's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub(crate) fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        unpack_state(self.inner.state_word.load(Ordering::Acquire)).0
    }

    /// Current generation; incremented by every transition.
    pub fn generation(&self) -> u64 {
        unpack_state(self.inner.state_word.load(Ordering::Acquire)).1
    }

    /// Request permission for one call.
    ///
    /// The returned permit must be consumed with exactly one outcome report
    /// or cancellation; dropping it unconsumed cancels.
    pub fn try_acquire(&self) -> Result<CircuitPermit, CallNotPermitted> {
        loop {
            let word = self.inner.state_word.load(Ordering::Acquire);
            let (state, generation) = unpack_state(word);
            let current = self.inner.current_generation();
            if current.number != generation {
                // A transition is being installed; re-read.
                std::hint::spin_loop();
                continue;
            }
            match state {
                CircuitState::Closed | CircuitState::Disabled => {
                    return Ok(CircuitPermit {
                        shared: Arc::clone(&self.inner),
                        generation: current,
                        done: false,
                    });
                }
                CircuitState::ForcedOpen => return Err(self.inner.reject()),
                CircuitState::Open => {
                    let waited = current
                        .opened_at
                        .map(|at| self.inner.clock.now().saturating_duration_since(at))
                        .unwrap_or_default();
                    if waited >= self.inner.config.wait_in_open {
                        BreakerShared::try_transition(
                            &self.inner,
                            generation,
                            CircuitState::Open,
                            CircuitState::HalfOpen,
                        );
                        continue;
                    }
                    return Err(self.inner.reject());
                }
                CircuitState::HalfOpen => {
                    let permitted = self.inner.config.permitted_calls_in_half_open;
                    let claimed = current.trial_calls.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |calls| (calls < permitted).then_some(calls + 1),
                    );
                    return match claimed {
                        Ok(_) => Ok(CircuitPermit {
                            shared: Arc::clone(&self.inner),
                            generation: current,
                            done: false,
                        }),
                        Err(_) => Err(self.inner.reject()),
                    };
                }
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection.
    #[instrument(skip(self, operation), fields(breaker = %self.name(), state = %self.state()))]
    pub fn call<F, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.call_classified(operation, |_| false)
    }

    /// Like [`call`](Self::call), additionally classifying successful values
    /// as failures when `record_result` returns true.
    pub fn call_classified<F, T, E, R>(&self, operation: F, record_result: R) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        R: Fn(&T) -> bool,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire()?;
        let started = self.inner.clock.now();
        match operation() {
            Ok(value) => {
                let duration = self.inner.clock.now().saturating_duration_since(started);
                if record_result(&value) {
                    permit.record_failure(duration);
                } else {
                    permit.record_success(duration);
                }
                Ok(value)
            }
            Err(error) => {
                let duration = self.inner.clock.now().saturating_duration_since(started);
                permit.record_error(duration, &error);
                Err(PolicyError::OperationFailed { source: error })
            }
        }
    }

    /// Execute an async operation with circuit breaker protection.
    #[instrument(skip(self, operation), fields(breaker = %self.name(), state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_classified(operation, |_| false).await
    }

    /// Like [`execute`](Self::execute) with result classification.
    pub async fn execute_classified<F, Fut, T, E, R>(
        &self,
        operation: F,
        record_result: R,
    ) -> PolicyResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&T) -> bool,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire()?;
        let started = self.inner.clock.now();
        match operation().await {
            Ok(value) => {
                let duration = self.inner.clock.now().saturating_duration_since(started);
                if record_result(&value) {
                    permit.record_failure(duration);
                } else {
                    permit.record_success(duration);
                }
                Ok(value)
            }
            Err(error) => {
                let duration = self.inner.clock.now().saturating_duration_since(started);
                permit.record_error(duration, &error);
                Err(PolicyError::OperationFailed { source: error })
            }
        }
    }

    /// Stop recording and permit every call until explicitly transitioned.
    pub fn transition_to_disabled(&self) {
        self.force_transition(CircuitState::Disabled);
    }

    /// Reject every call until explicitly transitioned.
    pub fn transition_to_forced_open(&self) {
        self.force_transition(CircuitState::ForcedOpen);
    }

    /// Return to normal closed operation with a fresh window.
    pub fn transition_to_closed(&self) {
        self.force_transition(CircuitState::Closed);
    }

    /// Reset to a fresh closed state and publish a reset event.
    pub fn reset(&self) {
        self.force_transition(CircuitState::Closed);
        self.inner.events.publish(EventKind::CircuitReset);
        info!(breaker = %self.inner.name, "Circuit breaker reset to closed state");
    }

    fn force_transition(&self, to: CircuitState) {
        loop {
            let word = self.inner.state_word.load(Ordering::Acquire);
            let (state, generation) = unpack_state(word);
            if BreakerShared::try_transition(&self.inner, generation, state, to) {
                return;
            }
        }
    }

    /// Snapshot of state, window aggregates, and rejection count.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, generation) = unpack_state(self.inner.state_word.load(Ordering::Acquire));
        let window = self.inner.current_generation().window.snapshot(self.inner.clock.now());
        CircuitBreakerMetrics {
            state,
            generation,
            window,
            rejected_calls: self.inner.rejected_calls.load(Ordering::Acquire),
        }
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
