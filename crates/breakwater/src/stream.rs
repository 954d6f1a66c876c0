//! Push-stream operators over the policies
//!
//! Each operator acquires permission when the stream is wrapped (the
//! subscribe path, before the inner stream is first polled) and reports the
//! terminal outcome back to its policy. A denial produces a one-shot stream
//! that emits the rejection error and completes. The first `Err` item is
//! treated as the upstream's terminal error signal: it is reported, forwarded,
//! and the operator fuses. Dropping an operator before a terminal signal
//! counts as cancellation; held permits are released exactly once by their
//! drop guards, and no further outcome events are emitted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;

use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::circuit_breaker::{CircuitBreaker, CircuitPermit};
use crate::clock::Clock;
use crate::error::{BulkheadFull, CallNotPermitted, PolicyError, RequestNotPermitted};
use crate::events::EventKind;
use crate::rate_limiter::RateLimiter;
use crate::retry::{Retry, RetryDecision, RetryPolicy, RetryShared};

/// Stream combinator produced by [`CircuitBreaker::wrap_stream`]
pub struct CircuitBreakerStream<S> {
    inner: Option<Pin<Box<S>>>,
    permit: Option<CircuitPermit>,
    rejected: Option<CallNotPermitted>,
    clock: Arc<dyn Clock>,
    started: Instant,
    done: bool,
}

impl CircuitBreaker {
    /// Guard a push stream: permission is acquired now, items are forwarded,
    /// and the terminal signal (completion, first error, or drop) is reported
    /// as this call's outcome.
    pub fn wrap_stream<S, T, E>(&self, stream: S) -> CircuitBreakerStream<S>
    where
        S: Stream<Item = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let clock = self.clock_handle();
        let started = clock.now();
        match self.try_acquire() {
            Ok(permit) => CircuitBreakerStream {
                inner: Some(Box::pin(stream)),
                permit: Some(permit),
                rejected: None,
                clock,
                started,
                done: false,
            },
            Err(rejection) => CircuitBreakerStream {
                inner: None,
                permit: None,
                rejected: Some(rejection),
                clock,
                started,
                done: false,
            },
        }
    }
}

impl<S, T, E> Stream for CircuitBreakerStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(rejection) = this.rejected.take() {
            this.done = true;
            return Poll::Ready(Some(Err(PolicyError::CircuitOpen(rejection))));
        }
        let Some(inner) = this.inner.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                this.done = true;
                let elapsed = this.clock.now().saturating_duration_since(this.started);
                if let Some(permit) = this.permit.take() {
                    permit.record_error(elapsed, &error);
                }
                Poll::Ready(Some(Err(PolicyError::OperationFailed { source: error })))
            }
            Poll::Ready(None) => {
                this.done = true;
                let elapsed = this.clock.now().saturating_duration_since(this.started);
                if let Some(permit) = this.permit.take() {
                    permit.record_success(elapsed);
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Stream combinator produced by [`Bulkhead::wrap_stream`]
pub struct BulkheadStream<S> {
    inner: Option<Pin<Box<S>>>,
    permit: Option<BulkheadPermit>,
    rejected: Option<BulkheadFull>,
    done: bool,
}

impl Bulkhead {
    /// Guard a push stream: a slot is claimed now (without waiting) and
    /// released exactly once on the terminal signal or on drop.
    pub fn wrap_stream<S, T, E>(&self, stream: S) -> BulkheadStream<S>
    where
        S: Stream<Item = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.try_acquire() {
            Ok(permit) => BulkheadStream {
                inner: Some(Box::pin(stream)),
                permit: Some(permit),
                rejected: None,
                done: false,
            },
            Err(rejection) => {
                BulkheadStream { inner: None, permit: None, rejected: Some(rejection), done: false }
            }
        }
    }
}

impl<S, T, E> Stream for BulkheadStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(rejection) = this.rejected.take() {
            this.done = true;
            return Poll::Ready(Some(Err(PolicyError::BulkheadFull(rejection))));
        }
        let Some(inner) = this.inner.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                this.done = true;
                drop(this.permit.take());
                Poll::Ready(Some(Err(PolicyError::OperationFailed { source: error })))
            }
            Poll::Ready(None) => {
                this.done = true;
                drop(this.permit.take());
                Poll::Ready(None)
            }
        }
    }
}

/// Stream combinator produced by [`RateLimiter::wrap_stream`]
pub struct RateLimiterStream<S> {
    inner: Option<Pin<Box<S>>>,
    rejected: Option<RequestNotPermitted>,
    done: bool,
}

impl RateLimiter {
    /// Guard a push stream: one permit is claimed now, without waiting.
    pub fn wrap_stream<S, T, E>(&self, stream: S) -> RateLimiterStream<S>
    where
        S: Stream<Item = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.try_acquire() {
            Ok(()) => {
                RateLimiterStream { inner: Some(Box::pin(stream)), rejected: None, done: false }
            }
            Err(rejection) => {
                RateLimiterStream { inner: None, rejected: Some(rejection), done: false }
            }
        }
    }
}

impl<S, T, E> Stream for RateLimiterStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(rejection) = this.rejected.take() {
            this.done = true;
            return Poll::Ready(Some(Err(PolicyError::RateLimited(rejection))));
        }
        let Some(inner) = this.inner.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(PolicyError::OperationFailed { source: error })))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

/// Stream combinator produced by [`Retry::wrap_stream_factory`]
///
/// Pull streams cannot be re-subscribed, so retrying takes a factory: when
/// the current inner stream terminates with a retryable error and attempts
/// remain, a fresh stream is obtained from the factory after the backoff
/// interval.
pub struct RetryStream<S, F, P> {
    shared: Arc<RetryShared>,
    factory: F,
    policy: P,
    inner: Option<Pin<Box<S>>>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
    attempt: u32,
    done: bool,
}

impl Retry {
    /// Guard a re-subscribable push stream.
    pub fn wrap_stream_factory<S, F, P, T, E>(&self, policy: P, mut factory: F) -> RetryStream<S, F, P>
    where
        S: Stream<Item = Result<T, E>>,
        F: FnMut() -> S,
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.inner.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let first = Box::pin(factory());
        RetryStream {
            shared: Arc::clone(&self.inner),
            factory,
            policy,
            inner: Some(first),
            delay: None,
            attempt: 1,
            done: false,
        }
    }
}

impl<S, F, P, T, E> Stream for RetryStream<S, F, P>
where
    S: Stream<Item = Result<T, E>>,
    F: FnMut() -> S + Unpin,
    P: RetryPolicy<E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(delay) = this.delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        this.delay = None;
                        this.inner = Some(Box::pin((this.factory)()));
                    }
                }
            }
            let Some(inner) = this.inner.as_mut() else {
                this.done = true;
                return Poll::Ready(None);
            };
            match inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                Poll::Ready(None) => {
                    this.done = true;
                    this.shared.record_success(this.attempt);
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(error))) => {
                    this.inner = None;
                    let max_attempts = this.shared.config.max_attempts;
                    if this.attempt >= max_attempts {
                        this.done = true;
                        this.shared.record_failure(this.attempt);
                        this.shared.events.publish(EventKind::RetryExhausted {
                            attempts: this.attempt,
                            error: error.to_string(),
                        });
                        return Poll::Ready(Some(Err(PolicyError::RetriesExhausted {
                            attempts: this.attempt,
                            source: error,
                        })));
                    }
                    let wait: Duration = match this.policy.should_retry(&error, this.attempt) {
                        RetryDecision::Stop => {
                            this.done = true;
                            this.shared.record_failure(this.attempt);
                            this.shared
                                .events
                                .publish(EventKind::RetryErrorIgnored { error: error.to_string() });
                            return Poll::Ready(Some(Err(PolicyError::OperationFailed {
                                source: error,
                            })));
                        }
                        RetryDecision::Retry => this.shared.interval(this.attempt),
                        RetryDecision::RetryAfter(custom) => custom,
                    };
                    this.shared
                        .events
                        .publish(EventKind::RetryScheduled { attempt: this.attempt, wait });
                    this.attempt += 1;
                    this.delay = Some(Box::pin(tokio::time::sleep(wait)));
                    // Loop: poll the delay so the waker is registered.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::rate_limiter::RateLimiterConfig;
    use crate::retry::{policies, RetryConfig};
    use crate::window::WindowKind;

    fn items(values: Vec<Result<u32, std::io::Error>>) -> impl Stream<Item = Result<u32, std::io::Error>> {
        tokio_stream::iter(values)
    }

    #[tokio::test]
    async fn test_breaker_stream_forwards_and_records_success() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder().minimum_calls(1).build().unwrap(),
        )
        .unwrap();

        let mut stream = breaker.wrap_stream(items(vec![Ok(1), Ok(2)]));
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.is_none());

        let metrics = breaker.metrics();
        assert_eq!(metrics.window.total_calls, 1);
        assert_eq!(metrics.window.failed_calls, 0);
    }

    #[tokio::test]
    async fn test_breaker_stream_rejects_when_forced_open() {
        let breaker = CircuitBreaker::with_defaults("test");
        breaker.transition_to_forced_open();

        let mut stream = breaker.wrap_stream(items(vec![Ok(1)]));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(PolicyError::CircuitOpen(_))));
        assert!(stream.next().await.is_none(), "rejection completes the stream");
        assert_eq!(breaker.metrics().window.total_calls, 0);
    }

    #[tokio::test]
    async fn test_breaker_stream_records_terminal_error() {
        let config = CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .sliding_window(WindowKind::CountBased, 1)
            .minimum_calls(1)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new("test", config).unwrap();

        let mut stream =
            breaker.wrap_stream(items(vec![Ok(1), Err(std::io::Error::other("mid-stream"))]));
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        let failed = stream.next().await.unwrap();
        assert!(matches!(failed, Err(PolicyError::OperationFailed { .. })));
        assert!(stream.next().await.is_none(), "fused after the terminal error");

        assert_eq!(breaker.metrics().window.failed_calls, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_breaker_stream_drop_cancels_without_outcome() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder().minimum_calls(1).build().unwrap(),
        )
        .unwrap();

        let mut stream = breaker.wrap_stream(items(vec![Ok(1), Ok(2)]));
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        drop(stream);

        assert_eq!(breaker.metrics().window.total_calls, 0, "no outcome recorded on cancel");
    }

    #[tokio::test]
    async fn test_bulkhead_stream_completion_releases_once() {
        let config = BulkheadConfig::builder().max_concurrent(1).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let mut stream = bulkhead.wrap_stream(items(vec![Ok(1), Ok(2)]));
        assert_eq!(bulkhead.available_permits(), 0);
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.is_none());
        // Polling past the end must not release again.
        assert!(stream.next().await.is_none());
        drop(stream);

        assert_eq!(bulkhead.available_permits(), 1);
        let finished = bulkhead
            .events()
            .history_filtered(|k| matches!(k, EventKind::CallFinished));
        assert_eq!(finished.len(), 1);
    }

    #[tokio::test]
    async fn test_bulkhead_stream_cancel_before_any_item() {
        let config = BulkheadConfig::builder().max_concurrent(1).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let stream = bulkhead.wrap_stream(items(vec![Ok(1)]));
        drop(stream);

        assert_eq!(bulkhead.available_permits(), 1);
        let finished = bulkhead
            .events()
            .history_filtered(|k| matches!(k, EventKind::CallFinished));
        assert_eq!(finished.len(), 1, "completion accounted exactly once");
    }

    #[tokio::test]
    async fn test_bulkhead_stream_rejection_never_completes_accounting() {
        let config = BulkheadConfig::builder().max_concurrent(1).build().unwrap();
        let bulkhead = Bulkhead::new("test", config).unwrap();

        let _held = bulkhead.try_acquire().unwrap();
        let mut stream = bulkhead.wrap_stream(items(vec![Ok(1)]));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(PolicyError::BulkheadFull(_))));
        drop(stream);

        let finished = bulkhead
            .events()
            .history_filtered(|k| matches!(k, EventKind::CallFinished));
        assert!(finished.is_empty(), "a rejected subscription finishes nothing");
    }

    #[tokio::test]
    async fn test_rate_limiter_stream_rejection() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap();
        let limiter = RateLimiter::new("test", config).unwrap();

        let mut allowed = limiter.wrap_stream(items(vec![Ok(1)]));
        assert_eq!(allowed.next().await.unwrap().unwrap(), 1);

        let mut denied = limiter.wrap_stream(items(vec![Ok(2)]));
        let first = denied.next().await.unwrap();
        assert!(matches!(first, Err(PolicyError::RateLimited(_))));
        assert!(denied.next().await.is_none());
    }

    #[tokio::test]
    async fn test_retry_stream_resubscribes_on_error() {
        let retry = Retry::new(
            "test",
            RetryConfig::builder()
                .max_attempts(3)
                .fixed_backoff(Duration::from_millis(1))
                .build()
                .unwrap(),
        )
        .unwrap();

        let subscriptions = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let subscriptions_clone = Arc::clone(&subscriptions);
        let mut stream = retry.wrap_stream_factory(policies::AlwaysRetry, move || {
            let attempt = subscriptions_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if attempt == 0 {
                items(vec![Err(std::io::Error::other("cold start"))])
            } else {
                items(vec![Ok(1), Ok(2)])
            }
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.is_none());
        assert_eq!(subscriptions.load(std::sync::atomic::Ordering::SeqCst), 2);

        let scheduled = retry
            .events()
            .history_filtered(|k| matches!(k, EventKind::RetryScheduled { .. }));
        assert_eq!(scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_stream_exhaustion() {
        let retry = Retry::new(
            "test",
            RetryConfig::builder()
                .max_attempts(2)
                .fixed_backoff(Duration::from_millis(1))
                .build()
                .unwrap(),
        )
        .unwrap();

        let mut stream = retry.wrap_stream_factory(policies::AlwaysRetry, || {
            items(vec![Err(std::io::Error::other("always down"))])
        });

        let last = stream.next().await.unwrap();
        assert!(matches!(last, Err(PolicyError::RetriesExhausted { attempts: 2, .. })));
        assert!(stream.next().await.is_none());
        assert_eq!(retry.metrics().failed_after_retry, 1);
    }
}
