//! Daemon event delivery.
//!
//! [`EventHub`] offers two ways to follow [`DaemonEvent`]s:
//!
//! | API | Delivery |
//! |---|---|
//! | [`EventHub::on`] | synchronous callback, deregistered through its [`Subscription`] handle |
//! | [`EventHub::subscribe`] | [`tokio::sync::broadcast`] receiver for async consumers |
//!
//! There is no global listener state: a listener lives exactly as long as
//! its [`Subscription`].  Dropping the handle (or calling
//! [`Subscription::off`]) removes it, so reconnecting hosts never leak
//! listeners.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use mnemo_types::DaemonEvent;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 64;

type Listener = Arc<dyn Fn(&DaemonEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: BTreeMap<u64, Listener>,
}

/// Fan-out point for daemon events.  Clone it cheaply; clones share the same
/// listeners and channel.
#[derive(Clone)]
pub struct EventHub {
    listeners: Arc<Mutex<Listeners>>,
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            sender,
        }
    }

    /// Register `callback` for every future event.
    ///
    /// The listener stays registered while the returned handle is alive.
    #[must_use = "dropping the subscription immediately removes the listener"]
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DaemonEvent) + Send + Sync + 'static,
    {
        let id = match self.listeners.lock() {
            Ok(mut inner) => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.callbacks.insert(id, Arc::new(callback));
                Some(id)
            }
            Err(_) => {
                warn!("listener registry poisoned; callback not registered");
                None
            }
        };
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// A broadcast receiver of every future event.  Slow receivers lag and
    /// lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to every callback, in registration order, and to the
    /// broadcast channel.  Callbacks run outside the registry lock so they
    /// may register or drop subscriptions themselves.
    pub fn emit(&self, event: DaemonEvent) {
        let snapshot: Vec<Listener> = match self.listeners.lock() {
            Ok(inner) => inner.callbacks.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for callback in snapshot {
            callback(&event);
        }
        // No receivers is a normal condition.
        let _ = self.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.callbacks.len()).unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Registration handle returned by [`EventHub::on`].
pub struct Subscription {
    id: Option<u64>,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove the listener now.  Equivalent to dropping the handle.
    pub fn off(self) {}

    fn remove(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut inner) = listeners.lock() {
                inner.callbacks.remove(&id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn extracted(count: usize) -> DaemonEvent {
        DaemonEvent::MemoriesExtracted {
            count,
            session_id: "s1".into(),
        }
    }

    #[test]
    fn listener_receives_events_until_off() {
        let hub = EventHub::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = hub.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(extracted(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.off();
        hub.emit(extracted(3));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn dropping_the_handle_deregisters() {
        let hub = EventHub::default();
        {
            let _sub = hub.on(|_| {});
            assert_eq!(hub.listener_count(), 1);
        }
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn handle_outliving_hub_is_harmless() {
        let hub = EventHub::default();
        let sub = hub.on(|_| {});
        drop(hub);
        sub.off();
    }

    #[test]
    fn independent_listeners_all_fire() {
        let hub = EventHub::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let subs: Vec<Subscription> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&seen);
                hub.on(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        hub.emit(DaemonEvent::Error("boom".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        drop(subs);
    }

    #[tokio::test]
    async fn broadcast_subscribers_receive_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        hub.emit(extracted(4));
        assert_eq!(rx.recv().await.unwrap(), extracted(4));
    }
}
