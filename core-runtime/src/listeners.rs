//! # Listener Registry
//!
//! Observer lists used by the connectivity monitor and offline queue for
//! synchronous change callbacks.
//!
//! Semantics:
//! - Registering the same `Arc` twice keeps a single registration.
//! - [`ListenerSet::notify`] iterates over a snapshot, so listeners may
//!   subscribe or unsubscribe while a notification is in flight. A listener
//!   removed mid-notification still receives the in-flight value; one added
//!   mid-notification does not.
//! - A panicking listener is logged and skipped; the remaining listeners
//!   still run.
//! - Dropping a [`Subscription`] does not unsubscribe. Call
//!   [`Subscription::unsubscribe`].

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

/// Callback registered on a [`ListenerSet`]
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Listener<T>)>,
}

/// Ordered set of listeners for values of type `T`
pub struct ListenerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `listener`, returning its disposer
    pub fn add(&self, listener: Listener<T>) -> Subscription {
        let mut registry = self.registry.lock();

        let existing = registry
            .entries
            .iter()
            .find(|(_, registered)| same_listener(registered, &listener))
            .map(|(id, _)| *id);

        let id = match existing {
            Some(id) => id,
            None => {
                let id = ListenerId(registry.next_id);
                registry.next_id += 1;
                registry.entries.push((id, listener));
                id
            }
        };
        drop(registry);

        self.subscription(id)
    }

    /// Returns `true` if the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        remove_from(&self.registry, id)
    }

    /// Invoke every registered listener with `value`
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self.registry.lock().entries.clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    error!(listener_id = id.0, "Listener panicked; continuing with remaining listeners")
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().entries.is_empty()
    }

    fn subscription(&self, id: ListenerId) -> Subscription {
        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            disposer: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    remove_from(&registry, id);
                }
            })),
        }
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.registry.lock().entries.len())
            .finish()
    }
}

fn remove_from<T>(registry: &Mutex<Registry<T>>, id: ListenerId) -> bool {
    let mut registry = registry.lock();
    let before = registry.entries.len();
    registry.entries.retain(|(entry_id, _)| *entry_id != id);
    registry.entries.len() != before
}

fn same_listener<T>(a: &Listener<T>, b: &Listener<T>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Disposer returned from listener registration
pub struct Subscription {
    id: ListenerId,
    disposer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Safe to call after the owning set is gone.
    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.disposer.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Listener<bool>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener: Listener<bool> = Arc::new(move |_: &bool| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn test_notify_reaches_every_listener() {
        let set = ListenerSet::new();
        let (a, listener_a) = counter();
        let (b, listener_b) = counter();
        set.add(listener_a);
        set.add(listener_b);

        assert_eq!(set.notify(&true), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_listener_registered_once() {
        let set = ListenerSet::new();
        let (count, listener) = counter();

        let first = set.add(Arc::clone(&listener));
        let second = set.add(listener);
        assert_eq!(first.id(), second.id());
        assert_eq!(set.len(), 1);

        set.notify(&false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let set = ListenerSet::new();
        let (count, listener) = counter();

        let subscription = set.add(listener);
        subscription.unsubscribe();

        assert!(set.is_empty());
        assert_eq!(set.notify(&true), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_after_set_dropped() {
        let set = ListenerSet::<bool>::new();
        let (_, listener) = counter();
        let subscription = set.add(listener);
        drop(set);

        subscription.unsubscribe();
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let set = ListenerSet::new();
        set.add(Arc::new(|_: &bool| panic!("listener bug")));
        let (count, listener) = counter();
        set.add(listener);

        assert_eq!(set.notify(&true), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_during_notify_uses_snapshot() {
        let set = Arc::new(ListenerSet::<bool>::new());
        let victim_id = Arc::new(Mutex::new(None::<ListenerId>));

        let remover_set = Arc::clone(&set);
        let remover_target = Arc::clone(&victim_id);
        set.add(Arc::new(move |_: &bool| {
            if let Some(id) = *remover_target.lock() {
                remover_set.remove(id);
            }
        }));

        let (count, listener) = counter();
        *victim_id.lock() = Some(set.add(listener).id());

        // Victim still sees the in-flight value
        assert_eq!(set.notify(&true), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(set.notify(&true), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
