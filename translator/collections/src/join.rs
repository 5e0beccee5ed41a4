use crate::{source::Subscribers, Collection, Dependent, Source, SourceId, Synced};
use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

/// The union of several collections of the same type.
///
/// When more than one collection holds a key, the value of the collection
/// listed first is used.
pub struct Join<T> {
    id: SourceId,
    name: String,
    sources: Vec<Arc<dyn Collection<T>>>,
    synced: Synced,
    subscribers: Subscribers,
}

impl<T: Send + Sync + 'static> Join<T> {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn Collection<T>>>) -> Arc<Self> {
        let join = Arc::new(Self {
            id: SourceId::next(),
            name: name.into(),
            sources,
            synced: Synced::new(),
            subscribers: Subscribers::default(),
        });
        for source in &join.sources {
            let dependent: Weak<dyn Dependent> = Arc::downgrade(&join) as Weak<dyn Dependent>;
            source.subscribe(dependent);
        }
        join.check_synced();
        join
    }

    fn check_synced(&self) {
        if self.sources.iter().all(|s| s.has_synced()) && self.synced.mark() {
            self.subscribers.notify_synced(self.id);
        }
    }
}

impl<T: Send + Sync + 'static> Dependent for Join<T> {
    fn on_change(&self, _: SourceId, keys: &[String]) {
        self.subscribers.notify(self.id, keys);
    }

    fn on_synced(&self, _: SourceId) {
        self.check_synced();
    }
}

impl<T: Send + Sync> Source for Join<T> {
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
        self.keys().len()
    }
}

impl<T: Send + Sync> Collection<T> for Join<T> {
    fn get(&self, key: &str) -> Option<Arc<T>> {
        self.sources.iter().find_map(|s| s.get(key))
    }

    fn list(&self) -> Vec<Arc<T>> {
        self.keys().iter().filter_map(|k| self.get(k)).collect()
    }

    fn keys(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|s| s.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
