use crate::{Collection, Dependent, Index, Source, SourceId, Synced};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

/// A dependency of one computed input key: a source and, optionally, the key
/// read from it. `None` stands for the whole source.
pub(crate) type Dep = (SourceId, Option<String>);

/// Passed to mapping functions. Every read made through the context is
/// recorded as a dependency of the input key being computed.
pub struct HandlerContext<'a> {
    dependent: &'a Weak<dyn Dependent>,
    subscribed: &'a mut HashSet<SourceId>,
    pending: &'a mut HashMap<SourceId, Synced>,
    deps: Vec<Dep>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        dependent: &'a Weak<dyn Dependent>,
        subscribed: &'a mut HashSet<SourceId>,
        pending: &'a mut HashMap<SourceId, Synced>,
    ) -> Self {
        Self {
            dependent,
            subscribed,
            pending,
            deps: Vec::new(),
        }
    }

    /// Records a dependency on `source`, subscribing to it the first time it
    /// is seen.
    pub(crate) fn track<S: Source + ?Sized>(&mut self, source: &S, key: Option<String>) {
        let id = source.id();
        if self.subscribed.insert(id) {
            source.subscribe(self.dependent.clone());
        }
        if !source.has_synced() {
            self.pending
                .entry(id)
                .or_insert_with(|| source.synced().clone());
        }
        self.deps.push((id, key));
    }

    pub fn fetch_one<T, C>(&mut self, collection: &C, key: &str) -> Option<Arc<T>>
    where
        C: Collection<T> + ?Sized,
    {
        self.track(collection, Some(key.to_string()));
        collection.get(key)
    }

    /// Reads every value in the collection. The caller is recomputed whenever
    /// any key of the collection changes.
    pub fn fetch<T, C>(&mut self, collection: &C) -> Vec<Arc<T>>
    where
        C: Collection<T> + ?Sized,
    {
        self.track(collection, None);
        collection.list()
    }

    pub fn fetch_filtered<T, C>(&mut self, collection: &C, f: impl Fn(&T) -> bool) -> Vec<Arc<T>>
    where
        C: Collection<T> + ?Sized,
    {
        self.fetch(collection)
            .into_iter()
            .filter(|v| f(v))
            .collect()
    }

    /// Reads the values stored under an index key. The caller is recomputed
    /// only when the set of values under that index key changes.
    pub fn fetch_index<T>(&mut self, index: &Index<T>, key: &str) -> Vec<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.track(index, Some(key.to_string()));
        index.lookup(key)
    }

    pub(crate) fn into_deps(self) -> Vec<Dep> {
        self.deps
    }
}
