//! Ordered observer lists with queue-then-apply registration.
//!
//! Listeners are added and removed through a cloneable [`Subscriber`]. The
//! requests are queued and applied by the [`CallbackRegistry`] right before
//! the next event is dispatched, so a listener may subscribe or unsubscribe
//! (itself included) while it is being called.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{ClientEvent, EventCategory};

/// Boxed event listener.
pub type Listener = Box<dyn FnMut(&ClientEvent) + Send>;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Change {
    Add {
        id: ListenerId,
        category: Option<EventCategory>,
        listener: Listener,
    },
    Remove(ListenerId),
}

/// Queues listener registrations for a [`CallbackRegistry`].
#[derive(Clone)]
pub struct Subscriber {
    next_id: Arc<AtomicU64>,
    pending: Arc<StdMutex<VecDeque<Change>>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("queued", &self.queue().len())
            .finish()
    }
}

impl Subscriber {
    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Change>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, category: Option<EventCategory>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queue().push_back(Change::Add {
            id,
            category,
            listener,
        });
        id
    }

    /// Registers `listener` for one category.
    pub fn subscribe<F>(&self, category: EventCategory, listener: F) -> ListenerId
    where
        F: FnMut(&ClientEvent) + Send + 'static,
    {
        self.add(Some(category), Box::new(listener))
    }

    /// Registers `listener` for every event.
    pub fn subscribe_all<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&ClientEvent) + Send + 'static,
    {
        self.add(None, Box::new(listener))
    }

    /// Removes a listener before the next dispatch. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.queue().push_back(Change::Remove(id));
    }

    /// Delivers every event to a bounded channel. Events are dropped with a
    /// warning when the channel is full, except `Disconnected`, which is
    /// always queued.
    pub fn channel(&self, capacity: usize) -> (ListenerId, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.subscribe_all(move |event| forward(&tx, event));
        (id, rx)
    }
}

fn forward(tx: &mpsc::Sender<ClientEvent>, event: &ClientEvent) {
    match tx.try_send(event.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            if matches!(dropped, ClientEvent::Disconnected { .. }) {
                // Last event of a session; hand it to a task so it is never lost.
                let tx = tx.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send(dropped).await;
                    });
                    return;
                }
            }
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(event)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

struct Entry {
    id: ListenerId,
    category: Option<EventCategory>,
    listener: Listener,
}

/// Ordered listener lists.
pub struct CallbackRegistry {
    subscriber: Subscriber,
    entries: Vec<Entry>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("listeners", &self.entries.len())
            .finish()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            subscriber: Subscriber {
                next_id: Arc::new(AtomicU64::new(1)),
                pending: Arc::new(StdMutex::new(VecDeque::new())),
            },
            entries: Vec::new(),
        }
    }

    pub fn subscriber(&self) -> Subscriber {
        self.subscriber.clone()
    }

    /// Number of listeners currently applied.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies queued registrations in the order they were made.
    pub fn apply_pending(&mut self) {
        let changes: Vec<Change> = self.subscriber.queue().drain(..).collect();
        for change in changes {
            match change {
                Change::Add {
                    id,
                    category,
                    listener,
                } => self.entries.push(Entry {
                    id,
                    category,
                    listener,
                }),
                Change::Remove(id) => self.entries.retain(|e| e.id != id),
            }
        }
    }

    /// Applies queued registrations, then calls every listener of the
    /// event's category in registration order.
    pub fn dispatch(&mut self, event: &ClientEvent) {
        self.apply_pending();
        let category = event.category();
        for entry in &mut self.entries {
            if entry.category.is_none_or(|c| c == category) {
                (entry.listener)(event);
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error_codes::DisconnectCause;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Listener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Listener {
                let log = Arc::clone(&log);
                Box::new(move |event: &ClientEvent| {
                    log.lock().unwrap().push(format!("{name}:{event:?}"));
                })
            }
        };
        (log, make)
    }

    #[test]
    fn listeners_run_in_registration_order_per_category() {
        let mut registry = CallbackRegistry::new();
        let sub = registry.subscriber();
        let (log, make) = recorder();
        sub.subscribe(EventCategory::Connection, make("first"));
        sub.subscribe(EventCategory::Matchmaking, make("mm"));
        sub.subscribe(EventCategory::Connection, make("second"));

        registry.dispatch(&ClientEvent::Connected);
        assert_eq!(*log.lock().unwrap(), vec!["first:Connected", "second:Connected"]);
    }

    #[test]
    fn registration_is_applied_before_next_dispatch() {
        let mut registry = CallbackRegistry::new();
        let sub = registry.subscriber();
        let (log, make) = recorder();
        let id = sub.subscribe_all(make("a"));
        assert!(registry.is_empty());

        registry.dispatch(&ClientEvent::JoinedRoom);
        sub.unsubscribe(id);
        assert_eq!(registry.len(), 1);
        registry.dispatch(&ClientEvent::LeftRoom);

        assert_eq!(*log.lock().unwrap(), vec!["a:JoinedRoom"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_dispatch() {
        let mut registry = CallbackRegistry::new();
        let sub = registry.subscriber();
        let calls = Arc::new(Mutex::new(0));
        let id_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let calls = Arc::clone(&calls);
            let id_slot = Arc::clone(&id_slot);
            let inner = sub.clone();
            sub.subscribe_all(move |_| {
                *calls.lock().unwrap() += 1;
                if let Some(id) = *id_slot.lock().unwrap() {
                    inner.unsubscribe(id);
                }
            })
        };
        *id_slot.lock().unwrap() = Some(id);

        registry.dispatch(&ClientEvent::Connected);
        registry.dispatch(&ClientEvent::Connected);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn channel_delivers_events() {
        let mut registry = CallbackRegistry::new();
        let (_id, mut rx) = registry.subscriber().channel(4);
        registry.dispatch(&ClientEvent::Disconnected {
            cause: DisconnectCause::ServerTimeout,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::Disconnected {
                cause: DisconnectCause::ServerTimeout
            }
        );
    }

    #[tokio::test]
    async fn full_channel_still_delivers_disconnected() {
        let mut registry = CallbackRegistry::new();
        let (_id, mut rx) = registry.subscriber().channel(1);
        registry.dispatch(&ClientEvent::Connected);
        registry.dispatch(&ClientEvent::JoinedRoom);
        registry.dispatch(&ClientEvent::Disconnected {
            cause: DisconnectCause::DisconnectByClientLogic,
        });

        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Connected);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClientEvent::Disconnected { .. }
        ));
    }
}
