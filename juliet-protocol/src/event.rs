//! Ordered publish/subscribe.
//!
//! Handlers run synchronously on the publishing thread, in the order they
//! were registered. Each publish works from a snapshot of the handler list,
//! so handlers may subscribe or unsubscribe without affecting the dispatch
//! in progress.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered handler. Ids are unique across all lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A list of handlers for events of type `T`.
pub struct Subscribers<T: ?Sized> {
    handlers: Mutex<Vec<(SubscriptionId, Arc<dyn Fn(&T) + Send + Sync>)>>,
}

impl<T: ?Sized> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler and returns its id.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    /// Calls every handler with `event`. Returns the number of handlers
    /// called.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl<T: ?Sized> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_in_registration_order() {
        let subs: Subscribers<u32> = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            subs.subscribe(move |v: &u32| seen.lock().push(format!("{}{}", tag, v)));
        }

        assert_eq!(subs.publish(&1), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe() {
        let subs: Subscribers<str> = Subscribers::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&count);
        let id = subs.subscribe(move |_: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        subs.publish("x");

        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        assert!(subs.is_empty());

        assert_eq!(subs.publish("y"), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_dispatch() {
        let subs: Arc<Subscribers<u8>> = Arc::new(Subscribers::new());
        let inner = Arc::clone(&subs);
        subs.subscribe(move |_: &u8| {
            inner.subscribe(|_: &u8| {});
        });

        // The handler added during dispatch is not called by that dispatch.
        assert_eq!(subs.publish(&0), 1);
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let subs: Subscribers<()> = Subscribers::default();
        let a = subs.subscribe(|_| {});
        let b = subs.subscribe(|_| {});
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sub-"));

        // An id from another list is not found here.
        let other: Subscribers<()> = Subscribers::new();
        let c = other.subscribe(|_| {});
        assert!(!subs.unsubscribe(c));
    }
}
