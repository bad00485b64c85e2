//! Single-assignment completion tracking for top-level runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::FailureDetails;

/// Terminal outcome of a tracked run as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Completed(String),
    Failed(FailureDetails),
    /// Force-resolved by `Client::suspend`.
    Canceled,
}

/// Future-like cell resolved exactly once; any number of readers may await it.
pub(crate) struct PendingCompletion {
    tx: watch::Sender<Option<Settled>>,
}

impl PendingCompletion {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the completion. Returns `false` (and changes nothing) if it was already resolved.
    pub(crate) fn resolve(&self, outcome: Settled) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub(crate) async fn wait(&self) -> Settled {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Settled::Canceled),
            // The sender lives as long as `self`, so this is unreachable in practice.
            Err(_) => Settled::Canceled,
        }
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<PendingCompletion>>,
    order: Vec<String>,
}

/// Completion map keyed by top-level instance id.
#[derive(Default)]
pub(crate) struct CompletionMap {
    inner: Mutex<Inner>,
}

impl CompletionMap {
    /// Start tracking `instance`. Re-scheduling an id replaces its previous entry.
    pub(crate) fn track(&self, instance: &str) -> Arc<PendingCompletion> {
        let pending = Arc::new(PendingCompletion::new());
        let mut inner = self.inner.lock();
        if inner.by_id.insert(instance.to_string(), pending.clone()).is_none() {
            inner.order.push(instance.to_string());
        }
        pending
    }

    pub(crate) fn get(&self, instance: &str) -> Option<Arc<PendingCompletion>> {
        self.inner.lock().by_id.get(instance).cloned()
    }

    pub(crate) fn contains(&self, instance: &str) -> bool {
        self.inner.lock().by_id.contains_key(instance)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.inner.lock().order.clone()
    }

    /// Resolve every still-pending completion with `outcome`, then forget all entries.
    pub(crate) fn drain_with(&self, outcome: Settled) -> usize {
        let drained: Vec<Arc<PendingCompletion>> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.by_id.drain().map(|(_, p)| p).collect()
        };
        drained.iter().filter(|p| p.resolve(outcome.clone())).count()
    }
}
