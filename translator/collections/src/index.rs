use crate::{source::Subscribers, Collection, Dependent, Source, SourceId, Synced};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

/// A secondary index over a collection.
///
/// Dependents are notified with the index keys whose membership changed, so
/// a mapping function that fetched one index key is recomputed only when the
/// values under that key change.
pub struct Index<T> {
    id: SourceId,
    name: String,
    source: Arc<dyn Collection<T>>,
    extract: Box<dyn Fn(&T) -> Vec<String> + Send + Sync>,
    state: RwLock<IndexState>,
    synced: Synced,
    subscribers: Subscribers,
}

#[derive(Default)]
struct IndexState {
    by_index: AHashMap<String, BTreeSet<String>>,
    by_object: AHashMap<String, Vec<String>>,
}

impl<T: Send + Sync + 'static> Index<T> {
    pub fn new<C>(
        name: impl Into<String>,
        source: Arc<C>,
        extract: impl Fn(&T) -> Vec<String> + Send + Sync + 'static,
    ) -> Arc<Self>
    where
        C: Collection<T> + ?Sized + 'static,
    {
        let source: Arc<dyn Collection<T>> = Arc::new(source);
        let index = Arc::new(Self {
            id: SourceId::next(),
            name: name.into(),
            source,
            extract: Box::new(extract),
            state: RwLock::new(IndexState::default()),
            synced: Synced::new(),
            subscribers: Subscribers::default(),
        });

        let dependent: Weak<dyn Dependent> = Arc::downgrade(&index) as Weak<dyn Dependent>;
        index.source.subscribe(dependent);
        index.update(index.source.keys());
        index.check_synced();
        index
    }

    /// Returns the values stored under the given index key.
    pub fn lookup(&self, key: &str) -> Vec<Arc<T>> {
        let keys = match self.state.read().by_index.get(key) {
            Some(keys) => keys.iter().cloned().collect::<Vec<_>>(),
            None => return Vec::new(),
        };
        keys.iter().filter_map(|k| self.source.get(k)).collect()
    }

    fn update(&self, keys: impl IntoIterator<Item = String>) {
        let mut changed = BTreeSet::new();
        {
            let mut state = self.state.write();
            for key in keys {
                let next = match self.source.get(&key) {
                    Some(obj) => (self.extract)(&obj),
                    None => Vec::new(),
                };
                let prev = state.by_object.remove(&key).unwrap_or_default();
                for idx in prev {
                    if let Some(members) = state.by_index.get_mut(&idx) {
                        members.remove(&key);
                        if members.is_empty() {
                            state.by_index.remove(&idx);
                        }
                    }
                    changed.insert(idx);
                }
                for idx in &next {
                    state
                        .by_index
                        .entry(idx.clone())
                        .or_default()
                        .insert(key.clone());
                    changed.insert(idx.clone());
                }
                if !next.is_empty() {
                    state.by_object.insert(key, next);
                }
            }
        }
        if !changed.is_empty() {
            let keys = changed.into_iter().collect::<Vec<_>>();
            self.subscribers.notify(self.id, &keys);
        }
    }

    fn check_synced(&self) {
        if self.source.has_synced() && self.synced.mark() {
            self.subscribers.notify_synced(self.id);
        }
    }
}

impl<T: Send + Sync + 'static> Dependent for Index<T> {
    fn on_change(&self, _: SourceId, keys: &[String]) {
        self.update(keys.iter().cloned());
    }

    fn on_synced(&self, _: SourceId) {
        self.check_synced();
    }
}

impl<T: Send + Sync> Source for Index<T> {
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

    /// The number of distinct index keys.
    fn len(&self) -> usize {
        self.state.read().by_index.len()
    }
}
