//! Listener registries with per-listener fault isolation.
//!
//! Notification iterates a snapshot of the registered listeners, so listeners
//! may register or unregister from inside a callback. A listener that panics
//! is logged and skipped; the remaining listeners are still notified.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

pub struct ListenerRegistry<L: ?Sized> {
    listeners: Arc<RwLock<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Clone for ListenerRegistry<L> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().clone()
    }

    /// Invoke `f` on every listener. Returns the number of listeners that
    /// panicked.
    pub fn notify(&self, event: &str, f: impl Fn(&L)) -> usize {
        let mut failures = 0;
        for listener in self.snapshot() {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                failures += 1;
                log::error!(
                    "listener failed while handling {event}: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
        failures
    }
}

/// Identity comparison that ignores vtable pointers.
pub(crate) fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Counter: Send + Sync {
        fn hit(&self);
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Counter for Counting {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl Counter for Exploding {
        fn hit(&self) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let first = Arc::new(Counting::default());
        let last = Arc::new(Counting::default());
        registry.add(first.clone());
        registry.add(Arc::new(Exploding));
        registry.add(last.clone());

        let failures = registry.notify("hit", |l| l.hit());

        assert_eq!(failures, 1);
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(last.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let a: Arc<dyn Counter> = Arc::new(Counting::default());
        let b: Arc<dyn Counter> = Arc::new(Counting::default());
        registry.add(a.clone());
        registry.add(b.clone());

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.len(), 1);
        assert!(same(&registry.snapshot()[0], &b));
    }

    #[test]
    fn test_listener_may_unregister_during_notify() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let counting: Arc<dyn Counter> = Arc::new(Counting::default());
        registry.add(counting.clone());

        let inner = registry.clone();
        let failures = registry.notify("hit", |l| {
            l.hit();
            inner.remove(&counting);
        });

        assert_eq!(failures, 0);
        assert!(registry.is_empty());
    }
}
