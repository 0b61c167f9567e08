//! Local in-process event bus using per-subscriber channels.
//!
//! Implements the engine's `EventSink` seam with poll semantics: each
//! subscriber owns a channel, publishes fan out to every matching
//! subscriber, and a subscriber whose channel is gone is pruned on the
//! next publish. Delivery is fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use facet_engine::{EngineEvent, EventKind, EventSink, FacetError, Result};

#[derive(Debug)]
struct Subscriber {
    /// Event kinds delivered to this subscriber; empty means all.
    kinds: Vec<EventKind>,
    sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
}

/// Local implementation of `EventSink` with per-subscriber channels.
pub struct LocalEventBus {
    next_id: AtomicUsize,
    subscribers: Mutex<HashMap<usize, Subscriber>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the given event kinds; an empty list receives
    /// everything. Returns a handle for `poll`/`stop`.
    pub fn subscribe(&self, kinds: Vec<EventKind>) -> usize {
        let (tx, rx) = mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            kinds,
            sender: tx,
            receiver: rx,
        };
        let mut subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
        subscribers.insert(id, subscriber);
        id
    }

    /// Take the next pending event for a subscriber, if any.
    pub fn poll(&self, handle: &usize) -> Result<Option<EngineEvent>> {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
        if let Some(sub) = subscribers.get_mut(handle) {
            match sub.receiver.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::TryRecvError::Empty) => Ok(None),
                Err(mpsc::TryRecvError::Disconnected) => {
                    subscribers.remove(handle);
                    Ok(None)
                }
            }
        } else {
            Err(FacetError::InvalidInput(format!(
                "unknown subscriber handle {handle}"
            )))
        }
    }

    pub fn stop(&self, handle: usize) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
        subscribers.remove(&handle);
    }

    fn matches(subscriber: &Subscriber, event: &EngineEvent) -> bool {
        subscriber.kinds.is_empty() || subscriber.kinds.contains(&event.kind())
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LocalEventBus {
    fn publish(&self, event: &EngineEvent) -> Result<()> {
        let mut to_remove = Vec::new();
        let subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
        for (id, sub) in subscribers.iter() {
            if Self::matches(sub, event) && sub.sender.send(event.clone()).is_err() {
                to_remove.push(*id);
            }
        }
        drop(subscribers);

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
            for id in to_remove {
                subs.remove(&id);
            }
        }

        Ok(())
    }
}
