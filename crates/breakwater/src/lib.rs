//! Fault-tolerance primitives for wrapping fallible work
//!
//! This crate provides **generic, reusable** resilience policies:
//! - **Circuit Breaker**: a five-state machine over a sliding outcome window
//!   that stops calling an unhealthy dependency
//! - **Rate Limiter**: a refill-based permit dispenser with timed waiting
//! - **Bulkhead**: a bounded concurrency gate with scoped permits
//! - **Retry**: bounded re-execution with configurable backoff and jitter
//!
//! Every policy is a named instance exposing the same three decorator
//! surfaces: synchronous `call`, future-based `execute`, and a push-stream
//! operator (`wrap_stream`). Instances publish typed lifecycle events on a
//! per-instance [`EventBus`](events::EventBus) and are collected in named
//! [`Registry`](registry::Registry) maps.
//!
//! # Examples
//!
//! ## Circuit breaker around an async call
//!
//! ```rust
//! use breakwater::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_rate_threshold(50.0)
//!     .minimum_calls(20)
//!     .build()?;
//! let breaker = CircuitBreaker::new("backend", config)?;
//!
//! let value = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry composed over a circuit breaker
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use breakwater::retry::policies;
//! use breakwater::{CircuitBreaker, Retry, RetryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = Arc::new(CircuitBreaker::with_defaults("backend"));
//! let retry = Retry::new(
//!     "backend",
//!     RetryConfig::builder()
//!         .max_attempts(3)
//!         .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_secs(5))
//!         .build()?,
//! )?;
//!
//! let result = retry
//!     .execute(policies::AlwaysRetry, || {
//!         let breaker = Arc::clone(&breaker);
//!         async move { breaker.execute(|| async { Ok::<_, std::io::Error>("ok") }).await }
//!     })
//!     .await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod window;

// Re-export commonly used types for convenience
// ------------------------------------------------
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitPermit, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{duration_millis, PolicySettings};
pub use error::{
    BulkheadFull, CallNotPermitted, ConfigError, ConfigResult, PolicyError, PolicyResult,
    RequestNotPermitted,
};
pub use events::{EventBus, EventKind, PolicyEvent, Subscription};
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterMetrics,
};
pub use registry::{
    BulkheadRegistry, CircuitBreakerRegistry, ObservablePolicy, RateLimiterRegistry, Registry,
    RegistryEvent, RetryRegistry,
};
pub use retry::{
    BackoffStrategy, Jitter, Retry, RetryConfig, RetryConfigBuilder, RetryDecision, RetryMetrics,
    RetryPolicy,
};
pub use window::{Outcome, OutcomeWindow, WindowKind, WindowSnapshot};
