//! Per-event-kind subscriber registries
//!
//! Each registration gets its own handle. Handles carry a generation so a
//! removed slot that was later reused can never be removed twice; several
//! registrations for the same kind are fully independent.

use crate::message::{Notification, NotificationKind};
use std::sync::{Arc, Mutex};
use tracing::debug;
use tw_net::TunnelName;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque handle returned by a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: NotificationKind,
    slot: usize,
    generation: u64,
}

impl Subscription {
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }
}

struct Slot<T> {
    generation: u64,
    callback: Option<Callback<T>>,
}

/// Handle table for one event kind
struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, callback: Callback<T>) -> (usize, u64) {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.generation += 1;
                entry.callback = Some(callback);
                (slot, entry.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    callback: Some(callback),
                });
                (self.slots.len() - 1, 0)
            }
        }
    }

    fn remove(&mut self, slot: usize, generation: u64) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.generation == generation && entry.callback.is_some() => {
                entry.callback = None;
                self.free.push(slot);
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> Vec<Callback<T>> {
        self.slots.iter().filter_map(|s| s.callback.clone()).collect()
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.callback.is_some()).count()
    }
}

struct Tables {
    tunnel_changed: Registry<TunnelName>,
    tunnels_changed: Registry<()>,
}

/// Subscriber registries owned by one client
pub struct Subscribers {
    tables: Mutex<Tables>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                tunnel_changed: Registry::new(),
                tunnels_changed: Registry::new(),
            }),
        }
    }

    /// Register for changes of a single tunnel's state
    pub fn on_tunnel_changed<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TunnelName) + Send + Sync + 'static,
    {
        let (slot, generation) = self.tables.lock().unwrap().tunnel_changed.insert(Arc::new(f));
        Subscription {
            kind: NotificationKind::TunnelChanged,
            slot,
            generation,
        }
    }

    /// Register for changes of the tunnel list
    pub fn on_tunnels_changed<F>(&self, f: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback<()> = Arc::new(move |_: &()| f());
        let (slot, generation) = self.tables.lock().unwrap().tunnels_changed.insert(callback);
        Subscription {
            kind: NotificationKind::TunnelsChanged,
            slot,
            generation,
        }
    }

    /// Remove one registration
    ///
    /// Takes effect for events dispatched after this call returns. Returns
    /// false if the handle was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut tables = self.tables.lock().unwrap();
        match subscription.kind {
            NotificationKind::TunnelChanged => tables
                .tunnel_changed
                .remove(subscription.slot, subscription.generation),
            NotificationKind::TunnelsChanged => tables
                .tunnels_changed
                .remove(subscription.slot, subscription.generation),
        }
    }

    /// Number of live registrations for a kind
    pub fn count(&self, kind: NotificationKind) -> usize {
        let tables = self.tables.lock().unwrap();
        match kind {
            NotificationKind::TunnelChanged => tables.tunnel_changed.len(),
            NotificationKind::TunnelsChanged => tables.tunnels_changed.len(),
        }
    }

    /// Invoke every subscriber registered for the event's kind
    ///
    /// Callbacks run on the calling thread after the registry lock is
    /// released, so they may register or unregister freely. Returns the
    /// number of callbacks invoked.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        match notification {
            Notification::TunnelChanged(raw) => {
                let name = match TunnelName::new(raw.as_str()) {
                    Ok(name) => name,
                    Err(_) => {
                        debug!("Dropping change event with invalid tunnel name {:?}", raw);
                        return 0;
                    }
                };
                let callbacks = self.tables.lock().unwrap().tunnel_changed.snapshot();
                for callback in &callbacks {
                    callback(&name);
                }
                callbacks.len()
            }
            Notification::TunnelsChanged => {
                let callbacks = self.tables.lock().unwrap().tunnels_changed.snapshot();
                for callback in &callbacks {
                    callback(&());
                }
                callbacks.len()
            }
        }
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fan_out_to_independent_subscribers() {
        let subs = Subscribers::new();
        let (a, fa) = counter();
        let (b, fb) = counter();
        subs.on_tunnels_changed(fa);
        subs.on_tunnels_changed(fb);

        assert_eq!(subs.dispatch(&Notification::TunnelsChanged), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_only_removes_one() {
        let subs = Subscribers::new();
        let (a, fa) = counter();
        let (b, fb) = counter();
        let first = subs.on_tunnels_changed(fa);
        subs.on_tunnels_changed(fb);

        assert!(subs.unsubscribe(first));
        subs.dispatch(&Notification::TunnelsChanged);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_handle_cannot_remove_reused_slot() {
        let subs = Subscribers::new();
        let (_, fa) = counter();
        let (b, fb) = counter();
        let first = subs.on_tunnels_changed(fa);
        assert!(subs.unsubscribe(first));

        subs.on_tunnels_changed(fb);
        assert!(!subs.unsubscribe(first));
        subs.dispatch(&Notification::TunnelsChanged);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tunnel_changed_receives_name() {
        let subs = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subs.on_tunnel_changed(move |name| sink.lock().unwrap().push(name.to_string()));

        subs.dispatch(&Notification::TunnelChanged("office".into()));
        subs.dispatch(&Notification::TunnelsChanged);
        assert_eq!(*seen.lock().unwrap(), vec!["office".to_string()]);
    }

    #[test]
    fn test_empty_name_is_dropped() {
        let subs = Subscribers::new();
        let (count, f) = counter();
        subs.on_tunnel_changed(move |_| f());

        assert_eq!(subs.dispatch(&Notification::TunnelChanged(String::new())), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let subs = Arc::new(Subscribers::new());
        let handle = Arc::new(Mutex::new(None));
        let (count, f) = counter();
        let inner_subs = Arc::clone(&subs);
        let inner_handle = Arc::clone(&handle);
        let sub = subs.on_tunnels_changed(move || {
            f();
            if let Some(h) = inner_handle.lock().unwrap().take() {
                inner_subs.unsubscribe(h);
            }
        });
        *handle.lock().unwrap() = Some(sub);

        subs.dispatch(&Notification::TunnelsChanged);
        subs.dispatch(&Notification::TunnelsChanged);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(subs.count(NotificationKind::TunnelsChanged), 0);
    }
}
