//! Per-instance event bus with bounded history
//!
//! Every policy instance owns one [`EventBus`]. Publishing stamps the event
//! with the policy name and wall-clock milliseconds, appends it to a bounded
//! ring of recent events (oldest evicted when full), and notifies subscribers
//! in subscription order on the publisher thread. Handler panics are caught
//! and discarded so a misbehaving observer can never affect policy behavior.
//!
//! Subscribers that need asynchronous handling hop threads themselves; the
//! bus never blocks on a subscriber.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::warn;

use crate::circuit_breaker::CircuitState;
use crate::clock::Clock;

/// Default number of events retained in the history ring
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// What happened, with kind-specific payloads
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A permitted call completed successfully (circuit breaker)
    CallSucceeded { duration: Duration },
    /// A permitted call failed with a recorded error (circuit breaker)
    CallFailed { duration: Duration, error: String },
    /// A permitted call failed with an ignored error; the window was bypassed
    ErrorIgnored { error: String },
    /// The circuit breaker refused a call
    CallNotPermitted,
    /// The circuit breaker moved between states
    StateTransition { from: CircuitState, to: CircuitState, generation: u64 },
    /// The circuit breaker was reset to a fresh closed state
    CircuitReset,
    /// The closed-state failure rate reached its threshold
    FailureRateExceeded { rate: f32 },
    /// The closed-state slow-call rate reached its threshold
    SlowCallRateExceeded { rate: f32 },
    /// A rate limiter granted a permit, possibly after waiting
    AcquireGranted { waited: Duration },
    /// A rate limiter denied a permit within the timeout budget
    AcquireDenied,
    /// A bulkhead admitted a call
    CallPermitted,
    /// A bulkhead rejected a call
    CallRejected,
    /// A bulkhead permit was returned
    CallFinished,
    /// A retry is about to wait and re-attempt
    RetryScheduled { attempt: u32, wait: Duration },
    /// A retried operation eventually succeeded
    RetrySucceeded { attempts: u32 },
    /// All retry attempts were exhausted
    RetryExhausted { attempts: u32, error: String },
    /// The retry predicate declined to retry this error
    RetryErrorIgnored { error: String },
}

/// A timestamped event published by a named policy instance
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvent {
    /// Name of the publishing policy instance
    pub policy: String,
    /// Milliseconds since the UNIX epoch at publish time
    pub at_millis: u64,
    /// Event payload
    pub kind: EventKind,
}

type EventHandler = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;
type EventFilter = Arc<dyn Fn(&EventKind) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

struct BusInner {
    policy: String,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<PolicyEvent>>,
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Cancellation token returned by [`EventBus::subscribe`]
///
/// Cancelling removes the handler without any cooperation from it. Dropping
/// the token leaves the subscription active.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the subscribed handler from the bus.
    pub fn cancel(self) {
        if let Some(inner) = self.bus.upgrade() {
            match inner.subscribers.write() {
                Ok(mut subs) => subs.retain(|s| s.id != self.id),
                Err(poisoned) => poisoned.into_inner().retain(|s| s.id != self.id),
            }
        }
    }
}

/// In-memory publish/subscribe bus for one policy instance
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus for the named policy with the default history capacity.
    pub fn new(policy: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(policy, clock, DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus retaining up to `capacity` recent events.
    pub fn with_capacity(policy: impl Into<String>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BusInner {
                policy: policy.into(),
                clock,
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Name of the owning policy instance.
    pub fn policy(&self) -> &str {
        &self.inner.policy
    }

    /// Publish an event: record it in the history ring and notify subscribers
    /// in subscription order. Never blocks beyond the bounded enqueue.
    pub fn publish(&self, kind: EventKind) {
        let event = PolicyEvent {
            policy: self.inner.policy.clone(),
            at_millis: self.inner.clock.millis_since_epoch(),
            kind,
        };

        match self.inner.history.lock() {
            Ok(mut history) => {
                if history.len() >= self.inner.capacity {
                    let _ = history.pop_front();
                }
                history.push_back(event.clone());
            }
            Err(poisoned) => {
                let history = &mut *poisoned.into_inner();
                if history.len() >= self.inner.capacity {
                    let _ = history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // Snapshot the handlers so no lock is held across user callbacks.
        let handlers: Vec<(Option<EventFilter>, EventHandler)> = match self.inner.subscribers.read()
        {
            Ok(subs) => {
                subs.iter().map(|s| (s.filter.clone(), Arc::clone(&s.handler))).collect()
            }
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|s| (s.filter.clone(), Arc::clone(&s.handler)))
                .collect(),
        };

        for (filter, handler) in handlers {
            if let Some(filter) = filter {
                if !filter(&event.kind) {
                    continue;
                }
            }
            let call = AssertUnwindSafe(|| handler(&event));
            if catch_unwind(call).is_err() {
                warn!(policy = %self.inner.policy, "Event handler panicked; panic discarded");
            }
        }
    }

    /// Subscribe a handler to every event from this instance.
    pub fn subscribe(&self, handler: impl Fn(&PolicyEvent) + Send + Sync + 'static) -> Subscription {
        self.subscribe_inner(None, Arc::new(handler))
    }

    /// Subscribe a handler to events matching the filter.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&EventKind) -> bool + Send + Sync + 'static,
        handler: impl Fn(&PolicyEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_inner(Some(Arc::new(filter)), Arc::new(handler))
    }

    pub(crate) fn subscribe_handler(&self, handler: EventHandler) -> Subscription {
        self.subscribe_inner(None, handler)
    }

    fn subscribe_inner(&self, filter: Option<EventFilter>, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber { id, filter, handler };
        match self.inner.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
        Subscription { id, bus: Arc::downgrade(&self.inner) }
    }

    /// Chronological snapshot of the retained history.
    pub fn history(&self) -> Vec<PolicyEvent> {
        match self.inner.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Chronological snapshot of retained events matching the filter.
    pub fn history_filtered(&self, filter: impl Fn(&EventKind) -> bool) -> Vec<PolicyEvent> {
        self.history().into_iter().filter(|e| filter(&e.kind)).collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("policy", &self.inner.policy)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::MockClock;

    fn bus() -> EventBus {
        EventBus::new("test-policy", Arc::new(MockClock::new()))
    }

    #[test]
    fn test_publish_records_history_in_order() {
        let bus = bus();
        bus.publish(EventKind::CallPermitted);
        bus.publish(EventKind::CallFinished);

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::CallPermitted);
        assert_eq!(history[1].kind, EventKind::CallFinished);
        assert_eq!(history[0].policy, "test-policy");
    }

    #[test]
    fn test_history_evicts_oldest_when_full() {
        let bus = EventBus::with_capacity("small", Arc::new(MockClock::new()), 2);
        bus.publish(EventKind::CallPermitted);
        bus.publish(EventKind::CallRejected);
        bus.publish(EventKind::CallFinished);

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::CallRejected);
        assert_eq!(history[1].kind, EventKind::CallFinished);
    }

    #[test]
    fn test_subscribers_notified_in_subscription_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order1 = Arc::clone(&order);
        let _sub1 = bus.subscribe(move |_| order1.lock().unwrap().push(1));
        let order2 = Arc::clone(&order);
        let _sub2 = bus.subscribe(move |_| order2.lock().unwrap().push(2));

        bus.publish(EventKind::CallPermitted);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_filtered_subscription() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe_filtered(
            |kind| matches!(kind, EventKind::CallRejected),
            move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.publish(EventKind::CallPermitted);
        bus.publish(EventKind::CallRejected);
        bus.publish(EventKind::CallFinished);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_subscription_stops_delivery() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let sub = bus.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventKind::CallPermitted);
        sub.cancel();
        bus.publish(EventKind::CallPermitted);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let _panicking = bus.subscribe(|_| panic!("intentional panic in handler"));
        let _counting = bus.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventKind::CallPermitted);

        // The panicking handler must not prevent later handlers or the publish.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history().len(), 1);
    }

    #[test]
    fn test_history_filtered() {
        let bus = bus();
        bus.publish(EventKind::CallPermitted);
        bus.publish(EventKind::CallRejected);

        let rejected = bus.history_filtered(|k| matches!(k, EventKind::CallRejected));
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_event_timestamps_use_clock() {
        let clock = MockClock::new();
        clock.set_elapsed(Duration::from_millis(1234));
        let bus = EventBus::new("timed", Arc::new(clock));
        bus.publish(EventKind::CallPermitted);
        assert_eq!(bus.history()[0].at_millis, 1234);
    }
}
