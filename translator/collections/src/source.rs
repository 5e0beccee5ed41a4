use crate::Synced;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Weak,
    },
};

/// Uniquely identifies a collection, index or trigger within the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

/// Anything a mapping function may depend on.
pub trait Source: Send + Sync {
    fn id(&self) -> SourceId;

    fn name(&self) -> &str;

    fn synced(&self) -> &Synced;

    fn has_synced(&self) -> bool {
        self.synced().has_synced()
    }

    /// Registers a dependent to be notified of changes. Dependents are held
    /// weakly and are dropped once they are no longer referenced elsewhere.
    fn subscribe(&self, dependent: Weak<dyn Dependent>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives change notifications from the sources it subscribed to.
pub trait Dependent: Send + Sync {
    /// The given keys of `source` were added, updated or removed. Sources
    /// without keys, like triggers, notify with an empty key set.
    fn on_change(&self, source: SourceId, keys: &[String]);

    fn on_synced(&self, source: SourceId);
}

#[derive(Default)]
pub(crate) struct Subscribers(Mutex<Vec<Weak<dyn Dependent>>>);

// === impl SourceId ===

impl SourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// === impl Subscribers ===

impl Subscribers {
    pub(crate) fn push(&self, dependent: Weak<dyn Dependent>) {
        self.0.lock().push(dependent);
    }

    /// Notifies every live dependent. The subscriber lock is released before
    /// any dependent runs, so dependents may subscribe to further sources.
    pub(crate) fn notify(&self, source: SourceId, keys: &[String]) {
        for dependent in self.live() {
            dependent.on_change(source, keys);
        }
    }

    pub(crate) fn notify_synced(&self, source: SourceId) {
        for dependent in self.live() {
            dependent.on_synced(source);
        }
    }

    fn live(&self) -> Vec<std::sync::Arc<dyn Dependent>> {
        let mut subs = self.0.lock();
        let mut live = Vec::with_capacity(subs.len());
        subs.retain(|weak| match weak.upgrade() {
            Some(dependent) => {
                live.push(dependent);
                true
            }
            None => false,
        });
        live
    }
}
