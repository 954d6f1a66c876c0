//! Named, process-scoped collections of policy instances
//!
//! A [`Registry`] memoises instances by name: the first `get_or_create` for a
//! name runs the supplied resolver, every later call returns the same
//! instance regardless of the resolver it was handed. Registry lifecycle
//! observers see entries come and go; instance-level observers can be wired
//! onto every current and future member in one call, producing a merged event
//! stream (each event already carries its policy name).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::events::{EventBus, PolicyEvent, Subscription};
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;

/// A policy type that exposes its name and event bus
pub trait ObservablePolicy {
    fn policy_name(&self) -> &str;
    fn event_bus(&self) -> &EventBus;
}

impl ObservablePolicy for CircuitBreaker {
    fn policy_name(&self) -> &str {
        self.name()
    }

    fn event_bus(&self) -> &EventBus {
        self.events()
    }
}

impl ObservablePolicy for RateLimiter {
    fn policy_name(&self) -> &str {
        self.name()
    }

    fn event_bus(&self) -> &EventBus {
        self.events()
    }
}

impl ObservablePolicy for Bulkhead {
    fn policy_name(&self) -> &str {
        self.name()
    }

    fn event_bus(&self) -> &EventBus {
        self.events()
    }
}

impl ObservablePolicy for Retry {
    fn policy_name(&self) -> &str {
        self.name()
    }

    fn event_bus(&self) -> &EventBus {
        self.events()
    }
}

/// Lifecycle events of a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    EntryAdded { name: String },
    EntryRemoved { name: String },
    EntryReplaced { name: String },
}

type RegistryHandler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;
type InstanceHandler = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;

struct RegistryObserver {
    id: u64,
    handler: RegistryHandler,
}

/// Name-keyed collection of policy instances
pub struct Registry<P> {
    entries: RwLock<HashMap<String, Arc<P>>>,
    observers: RwLock<Vec<RegistryObserver>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
    // Subscriptions are retained so merged-stream handlers outlive this call.
    instance_subscriptions: RwLock<Vec<Subscription>>,
    next_observer_id: AtomicU64,
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Registry<P> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            instance_handlers: RwLock::new(Vec::new()),
            instance_subscriptions: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to registry lifecycle events. Returns an id usable with
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, handler: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let observer = RegistryObserver { id, handler: Arc::new(handler) };
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
        id
    }

    /// Remove a lifecycle observer.
    pub fn unsubscribe(&self, id: u64) {
        match self.observers.write() {
            Ok(mut observers) => observers.retain(|o| o.id != id),
            Err(poisoned) => poisoned.into_inner().retain(|o| o.id != id),
        }
    }

    fn notify(&self, event: RegistryEvent) {
        let handlers: Vec<RegistryHandler> = match self.observers.read() {
            Ok(observers) => observers.iter().map(|o| Arc::clone(&o.handler)).collect(),
            Err(poisoned) => {
                poisoned.into_inner().iter().map(|o| Arc::clone(&o.handler)).collect()
            }
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!("Registry observer panicked; panic discarded");
            }
        }
    }

    /// All entries as `(name, instance)` pairs.
    pub fn all(&self) -> Vec<(String, Arc<P>)> {
        match self.entries.read() {
            Ok(entries) => entries.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect(),
        }
    }

    /// Look up an instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<P>> {
        match self.entries.read() {
            Ok(entries) => entries.get(name).map(Arc::clone),
            Err(poisoned) => poisoned.into_inner().get(name).map(Arc::clone),
        }
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove an instance by name.
    pub fn remove(&self, name: &str) -> Option<Arc<P>> {
        let removed = match self.entries.write() {
            Ok(mut entries) => entries.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        };
        if removed.is_some() {
            debug!(policy = name, "Registry entry removed");
            self.notify(RegistryEvent::EntryRemoved { name: name.to_string() });
        }
        removed
    }
}

impl<P: ObservablePolicy> Registry<P> {
    /// Return the instance registered under `name`, creating it with `init`
    /// when absent. Later calls with the same name return the memoised
    /// instance regardless of the resolver.
    pub fn get_or_create(&self, name: &str, init: impl FnOnce() -> P) -> Arc<P> {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let mut created = false;
        let instance = {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Double-checked: another thread may have created it meanwhile.
            match entries.get(name) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let instance = Arc::new(init());
                    entries.insert(name.to_string(), Arc::clone(&instance));
                    created = true;
                    instance
                }
            }
        };

        if created {
            debug!(policy = name, "Registry entry added");
            self.attach_instance_handlers(&instance);
            self.notify(RegistryEvent::EntryAdded { name: name.to_string() });
        }
        instance
    }

    /// Replace the instance registered under `name`, returning the previous
    /// one if present.
    pub fn replace(&self, name: &str, instance: P) -> Option<Arc<P>> {
        let instance = Arc::new(instance);
        self.attach_instance_handlers(&instance);
        let previous = {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.insert(name.to_string(), instance)
        };
        let event = if previous.is_some() {
            RegistryEvent::EntryReplaced { name: name.to_string() }
        } else {
            RegistryEvent::EntryAdded { name: name.to_string() }
        };
        self.notify(event);
        previous
    }

    /// Attach a handler to the event bus of every current and future member.
    /// Events already carry the policy name, so the handler sees one merged
    /// stream for the whole registry.
    pub fn subscribe_instance_events(
        &self,
        handler: impl Fn(&PolicyEvent) + Send + Sync + 'static,
    ) {
        let handler: InstanceHandler = Arc::new(handler);

        for (_, instance) in self.all() {
            let subscription = instance.event_bus().subscribe_handler(Arc::clone(&handler));
            match self.instance_subscriptions.write() {
                Ok(mut subs) => subs.push(subscription),
                Err(poisoned) => poisoned.into_inner().push(subscription),
            }
        }
        match self.instance_handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    fn attach_instance_handlers(&self, instance: &Arc<P>) {
        let handlers: Vec<InstanceHandler> = match self.instance_handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers {
            let subscription = instance.event_bus().subscribe_handler(handler);
            match self.instance_subscriptions.write() {
                Ok(mut subs) => subs.push(subscription),
                Err(poisoned) => poisoned.into_inner().push(subscription),
            }
        }
    }
}

impl<P> std::fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

/// Registry of circuit breakers
pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
/// Registry of rate limiters
pub type RateLimiterRegistry = Registry<RateLimiter>;
/// Registry of bulkheads
pub type BulkheadRegistry = Registry<Bulkhead>;
/// Registry of retry instances
pub type RetryRegistry = Registry<Retry>;
