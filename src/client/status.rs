//! Status/event broadcast plumbing shared by the provider's `onStatusChange`
//! and `onLocalChanges` listener registries.
//!
//! Grounded on the teacher's callback-registry pattern used for transport
//! events (see `other_examples` WebSocket transports): a `Vec` of boxed
//! callbacks behind a mutex, each tagged with an id so it can be removed
//! again. `send_if_modified`-style suppression of duplicate values is layered
//! on top for the `status` hub specifically (§4.3: "writing the same status
//! twice is suppressed").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub type ListenerId = u64;
type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// A simple pub/sub list: `notify` calls every live listener in registration
/// order; `unsubscribe` is idempotent.
pub struct Listeners<T: Clone> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T: Clone> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Listeners<T> {
    pub fn subscribe(&self, f: impl Fn(T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push((id, Box::new(f)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.entries.lock().unwrap().retain(|(i, _)| *i != id);
    }

    pub fn notify(&self, value: T) {
        for (_, f) in self.entries.lock().unwrap().iter() {
            f(value.clone());
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Connection status observed by `onStatusChange` listeners. Initial value
/// is `Offline`; transitions are produced only by the supervisor loop (or by
/// `disconnect()`/`destroy()`, called out in §4.3 as the one sanctioned
/// exception).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Offline,
    Connecting,
    Handshaking,
    Connected,
    Error,
}

/// Wraps a `Status` plus its listener registry, suppressing writes that
/// don't actually change the value.
#[derive(Default)]
pub struct StatusHub {
    current: Mutex<Status>,
    listeners: Listeners<Status>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Status::Offline),
            listeners: Listeners::default(),
        }
    }

    pub fn get(&self) -> Status {
        *self.current.lock().unwrap()
    }

    /// Set the status, notifying listeners only on an actual change.
    pub fn set(&self, new: Status) {
        let changed = {
            let mut guard = self.current.lock().unwrap();
            if *guard == new {
                false
            } else {
                *guard = new;
                true
            }
        };
        if changed {
            self.listeners.notify(new);
        }
    }

    pub fn subscribe(&self, f: impl Fn(Status) + Send + Sync + 'static) -> ListenerId {
        self.listeners.subscribe(f)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn duplicate_status_is_suppressed() {
        let hub = StatusHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        hub.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.set(Status::Offline); // same as initial, no notification
        assert_eq!(count.load(Ordering::SeqCst), 0);

        hub.set(Status::Connecting);
        hub.set(Status::Connecting); // duplicate, suppressed
        assert_eq!(count.load(Ordering::SeqCst), 1);

        hub.set(Status::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = StatusHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = hub.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.set(Status::Connecting);
        hub.unsubscribe(id);
        hub.set(Status::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
