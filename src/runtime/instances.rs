use parking_lot::RwLock;
use std::collections::HashMap;

use crate::OrchestrationContext;

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, OrchestrationContext>,
    // Insertion order, used for listing.
    order: Vec<String>,
}

/// Live contexts by instance id, for top-level and child runs alike.
///
/// Entries are inserted when a run is created and are only removed when the runtime shuts down.
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    inner: RwLock<Inner>,
}

impl InstanceRegistry {
    /// Register `ctx` unless a still-active run holds the same id. A finished run's entry is
    /// replaced in place, keeping its listing position.
    pub(crate) fn try_insert(&self, ctx: OrchestrationContext) -> bool {
        let id = ctx.instance_id().to_string();
        let mut inner = self.inner.write();
        match inner.by_id.get(&id) {
            Some(existing) if existing.is_active() => false,
            Some(_) => {
                inner.by_id.insert(id, ctx);
                true
            }
            None => {
                inner.by_id.insert(id.clone(), ctx);
                inner.order.push(id);
                true
            }
        }
    }

    pub(crate) fn get(&self, instance: &str) -> Option<OrchestrationContext> {
        self.inner.read().by_id.get(instance).cloned()
    }

    pub(crate) fn contains(&self, instance: &str) -> bool {
        self.inner.read().by_id.contains_key(instance)
    }

    /// Every id ever registered, in registration order.
    pub(crate) fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_id.clear();
        inner.order.clear();
    }
}
