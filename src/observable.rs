//! Observable values: "current value" plus "tell me when it changes".
//!
//! [`DynamicMultiRateLimiter`](crate::ratelimit::DynamicMultiRateLimiter)
//! only depends on the [`Observable`] trait, so any reactive source can feed
//! it. [`ObservableValue`] is the in-process implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

/// Callback invoked with every new value.
pub type Callback<T> = Arc<dyn Fn(Arc<T>) + Send + Sync>;

/// A value that can be read and watched.
pub trait Observable<T>: Send + Sync {
    /// The latest value.
    fn current(&self) -> Arc<T>;

    /// Register a callback for future changes. The callback stays registered
    /// until the returned [`Subscription`] is dropped.
    fn subscribe(&self, callback: Callback<T>) -> Subscription;
}

/// Handle for a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an unsubscribe action.
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to undo.
    pub fn detached() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

struct Shared<T> {
    value: RwLock<Arc<T>>,
    subscribers: Mutex<HashMap<u64, Callback<T>>>,
    next_id: AtomicU64,
}

/// Mutable, shareable observable value. Clones share the same value and
/// subscribers.
pub struct ObservableValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("value", &self.shared.value.read())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T> ObservableValue<T> {
    /// Create an observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: RwLock::new(Arc::new(value)),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the value and notify subscribers.
    ///
    /// Callbacks run on the calling thread, after the new value is visible
    /// through [`Observable::current`] and with no lock held.
    pub fn set(&self, value: T) {
        let value = Arc::new(value);
        *self.shared.value.write() = value.clone();

        let callbacks: Vec<Callback<T>> =
            self.shared.subscribers.lock().values().cloned().collect();
        for callback in callbacks {
            callback(value.clone());
        }
    }

    /// Replace the value with one derived from the current value.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.shared.value.read());
        self.set(next);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

impl<T> Observable<T> for ObservableValue<T>
where
    T: Send + Sync + 'static,
{
    fn current(&self) -> Arc<T> {
        self.shared.value.read().clone()
    }

    fn subscribe(&self, callback: Callback<T>) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().insert(id, callback);

        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.subscribers.lock().remove(&id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_current_reflects_set_and_update() {
        let value = ObservableValue::new(1);
        assert_eq!(*value.current(), 1);

        value.set(2);
        assert_eq!(*value.current(), 2);

        value.update(|v| v + 3);
        assert_eq!(*value.current(), 5);
    }

    #[test]
    fn test_subscribers_see_new_values() {
        let value = ObservableValue::new(String::from("a"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _subscription = value.subscribe(Arc::new(move |v: Arc<String>| {
            sink.lock().push((*v).clone());
        }));

        value.set("b".to_string());
        value.set("c".to_string());

        assert_eq!(*seen.lock(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let value = ObservableValue::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let subscription = value.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(value.subscriber_count(), 1);

        value.set(1);
        drop(subscription);
        value.set(2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(value.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_read_current_value() {
        let value = ObservableValue::new(10);
        let reader = value.clone();
        let observed = Arc::new(AtomicUsize::new(0));

        let sink = observed.clone();
        let _subscription = value.subscribe(Arc::new(move |_| {
            sink.store(*reader.current(), Ordering::SeqCst);
        }));

        value.set(42);
        assert_eq!(observed.load(Ordering::SeqCst), 42);
    }
}
