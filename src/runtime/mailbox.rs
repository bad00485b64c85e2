//! Event mailbox: rendezvous between `send_event`/`raise_event` producers and
//! `schedule_wait` consumers.
//!
//! Each key holds at most one of {waiting consumer, buffered payload}. Whichever side arrives
//! second consumes the other and the slot is removed. There is no queueing: a second buffered
//! payload replaces the first and a second waiter displaces the first (the displaced waiter
//! resolves to `Canceled`).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// How mailbox keys are scoped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MailboxScope {
    /// Key = (instance id, event name). Runs never see each other's payloads.
    #[default]
    PerInstance,
    /// Key = event name. Every run sharing the runtime sees every payload.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxKey {
    pub instance: Option<String>,
    pub name: String,
}

impl MailboxKey {
    pub fn new(scope: MailboxScope, instance: &str, name: impl Into<String>) -> Self {
        let instance = match scope {
            MailboxScope::PerInstance => Some(instance.to_string()),
            MailboxScope::Shared => None,
        };
        Self {
            instance,
            name: name.into(),
        }
    }
}

/// What happened to a sent payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a waiting consumer.
    Delivered,
    /// Stored for the next wait on the same key.
    Buffered,
}

enum Slot {
    Waiting { waiter: u64, tx: oneshot::Sender<String> },
    Buffered(String),
}

#[derive(Default)]
pub struct EventMailbox {
    slots: Mutex<HashMap<MailboxKey, Slot>>,
    next_waiter: AtomicU64,
}

impl EventMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to the waiter on `key`, or buffer it if nobody (alive) is waiting.
    pub fn send(&self, key: MailboxKey, payload: String) -> Delivery {
        let mut slots = self.slots.lock();
        let payload = match slots.remove(&key) {
            Some(Slot::Waiting { tx, .. }) => match tx.send(payload) {
                Ok(()) => return Delivery::Delivered,
                // Waiter was dropped (lost a race); keep the payload for the next wait.
                Err(payload) => payload,
            },
            Some(Slot::Buffered(previous)) => {
                tracing::debug!(
                    target: "duroxide_sim::runtime",
                    event_name = %key.name,
                    instance_id = ?key.instance,
                    replaced_len = previous.len(),
                    "Replacing buffered event payload"
                );
                payload
            }
            None => payload,
        };
        slots.insert(key, Slot::Buffered(payload));
        Delivery::Buffered
    }

    /// Wait for a payload on `key`.
    ///
    /// Consumes a buffered payload immediately if one is present. Resolves to `Canceled` when
    /// `cancel` fires, when a later wait on the same key displaces this one, or when the mailbox
    /// is cleared.
    pub async fn wait(&self, key: MailboxKey, cancel: &CancellationToken) -> Result<String> {
        let (waiter, mut rx) = {
            let mut slots = self.slots.lock();
            if let Some(Slot::Buffered(payload)) = slots.remove(&key) {
                return Ok(payload);
            }
            // Any previous waiter's sender is dropped by the remove above.
            let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            slots.insert(key.clone(), Slot::Waiting { waiter, tx });
            (waiter, rx)
        };

        tokio::select! {
            biased;
            received = &mut rx => {
                received.map_err(|_| Error::canceled(format!("wait for event '{}'", key.name)))
            }
            _ = cancel.cancelled() => {
                self.unregister(&key, waiter);
                rx.close();
                // A send may have raced the cancellation; do not lose its payload.
                if let Ok(payload) = rx.try_recv() {
                    self.send(key.clone(), payload);
                }
                Err(Error::canceled(format!("wait for event '{}'", key.name)))
            }
        }
    }

    fn unregister(&self, key: &MailboxKey, waiter: u64) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Waiting { waiter: w, .. }) if *w == waiter) {
            slots.remove(key);
        }
    }

    pub fn has_buffered(&self, key: &MailboxKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Buffered(_)))
    }

    pub fn has_waiter(&self, key: &MailboxKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Waiting { tx, .. }) if !tx.is_closed())
    }

    /// Drop the per-instance slots of `instance`, both buffered payloads and stale waiters.
    pub fn clear_instance(&self, instance: &str) {
        self.slots
            .lock()
            .retain(|key, _| key.instance.as_deref() != Some(instance));
    }

    /// Drop every buffered payload and every waiter (waiters resolve to `Canceled`).
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
