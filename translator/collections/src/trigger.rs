use crate::{source::Subscribers, Dependent, HandlerContext, Source, SourceId, Synced};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Weak,
};

/// Forces recomputation of everything that marked a dependency on it.
///
/// Used for state that is not itself a collection, such as sets maintained
/// by transport callbacks.
pub struct RecomputeTrigger {
    id: SourceId,
    name: String,
    generation: AtomicU64,
    synced: Synced,
    subscribers: Subscribers,
}

impl RecomputeTrigger {
    /// Creates a trigger. A trigger that starts unsynced holds back the
    /// synced signal of its dependents until [`Self::mark_synced`] is called.
    pub fn new(name: impl Into<String>, start_synced: bool) -> Self {
        Self {
            id: SourceId::next(),
            name: name.into(),
            generation: AtomicU64::new(0),
            synced: if start_synced {
                Synced::ready()
            } else {
                Synced::new()
            },
            subscribers: Subscribers::default(),
        }
    }

    pub fn mark_dependency(&self, ctx: &mut HandlerContext<'_>) {
        ctx.track(self, None);
    }

    pub fn trigger_recomputation(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(trigger = %self.name, generation, "Triggered");
        self.subscribers.notify(self.id, &[]);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        if self.synced.mark() {
            self.subscribers.notify_synced(self.id);
        }
    }
}

impl Source for RecomputeTrigger {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn synced(&self) -> &Synced {
        &self.synced
    }

    fn subscribe(&self, dependent: Weak<dyn Dependent>) {
        self.subscribers.push(dependent);
    }

    fn len(&self) -> usize {
        0
    }
}
