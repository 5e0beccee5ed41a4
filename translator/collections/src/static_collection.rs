use crate::{
    metrics::CollectionMetrics, source::Subscribers, Collection, Dependent, Keyed, Source, SourceId,
    Synced,
};
use ahash::AHashMap;
use futures::prelude::*;
use kube::runtime::watcher;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock, Weak};

/// A collection of externally supplied values, typically the objects of one
/// watched resource type.
pub struct StaticCollection<T> {
    id: SourceId,
    name: String,
    key: Box<dyn Fn(&T) -> String + Send + Sync>,
    store: RwLock<AHashMap<String, Arc<T>>>,
    synced: Synced,
    subscribers: Subscribers,
    metrics: OnceLock<CollectionMetrics>,
}

/// Keys namespaced resources as `namespace/name` and cluster-scoped resources
/// by name.
pub fn resource_key<K: kube::Resource>(obj: &K) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

impl<T> StaticCollection<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        key: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: SourceId::next(),
            name: name.into(),
            key: Box::new(key),
            store: RwLock::new(AHashMap::new()),
            synced: Synced::new(),
            subscribers: Subscribers::default(),
            metrics: OnceLock::new(),
        }
    }

    pub fn keyed(name: impl Into<String>) -> Self
    where
        T: Keyed,
    {
        Self::new(name, |obj: &T| obj.key())
    }

    pub fn for_resource(name: impl Into<String>) -> Self
    where
        T: kube::Resource,
    {
        Self::new(name, resource_key::<T>)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_metrics(self: Arc<Self>, metrics: &CollectionMetrics) -> Arc<Self> {
        if self.metrics.set(metrics.clone()).is_ok() {
            metrics.set_size(&self.name, self.len());
        }
        self
    }

    /// Inserts or replaces a value. Dependents are only notified when the
    /// stored value changed.
    pub fn apply(&self, obj: T) {
        let key = (self.key)(&obj);
        let changed = {
            let mut store = self.store.write();
            match store.get(&key) {
                Some(prev) if **prev == obj => false,
                _ => {
                    store.insert(key.clone(), Arc::new(obj));
                    true
                }
            }
        };
        if let Some(m) = self.metrics.get() {
            m.inc_applies(&self.name);
        }
        if changed {
            tracing::trace!(collection = %self.name, %key, "Applied");
            self.changed(vec![key]);
        }
    }

    pub fn delete(&self, key: &str) {
        let removed = self.store.write().remove(key).is_some();
        if let Some(m) = self.metrics.get() {
            m.inc_deletes(&self.name);
        }
        if removed {
            tracing::trace!(collection = %self.name, %key, "Deleted");
            self.changed(vec![key.to_string()]);
        }
    }

    /// Replaces the entire contents of the collection.
    pub fn reset(&self, objs: Vec<T>) {
        let mut changed = Vec::new();
        {
            let mut store = self.store.write();
            let mut next = AHashMap::with_capacity(objs.len());
            for obj in objs {
                let key = (self.key)(&obj);
                match store.remove(&key) {
                    Some(prev) if *prev == obj => {
                        next.insert(key, prev);
                    }
                    _ => {
                        changed.push(key.clone());
                        next.insert(key, Arc::new(obj));
                    }
                }
            }
            // Anything left over was not in the new list.
            changed.extend(store.drain().map(|(k, _)| k));
            *store = next;
        }
        if let Some(m) = self.metrics.get() {
            m.inc_resets(&self.name);
        }
        tracing::debug!(collection = %self.name, changed = changed.len(), "Reset");
        if !changed.is_empty() {
            self.changed(changed);
        }
    }

    pub fn mark_synced(&self) {
        if self.synced.mark() {
            tracing::debug!(collection = %self.name, size = self.len(), "Synced");
            if let Some(m) = self.metrics.get() {
                m.set_synced(&self.name);
            }
            self.subscribers.notify_synced(self.id);
        }
    }

    /// Applies watch events until the stream ends.
    ///
    /// Objects received between `Init` and `InitDone` replace the contents of
    /// the collection all at once, and the first `InitDone` marks the
    /// collection as synced.
    pub async fn run<S>(self: Arc<Self>, events: S)
    where
        S: Stream<Item = watcher::Event<T>>,
    {
        let mut events = std::pin::pin!(events);
        let mut init = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                watcher::Event::Init => init.clear(),
                watcher::Event::InitApply(obj) => init.push(obj),
                watcher::Event::InitDone => {
                    self.reset(std::mem::take(&mut init));
                    self.mark_synced();
                }
                watcher::Event::Apply(obj) => self.apply(obj),
                watcher::Event::Delete(obj) => {
                    let key = (self.key)(&obj);
                    self.delete(&key);
                }
            }
        }
        tracing::debug!(collection = %self.name, "Watch ended");
    }

    fn changed(&self, keys: Vec<String>) {
        if let Some(m) = self.metrics.get() {
            m.set_size(&self.name, self.len());
        }
        self.subscribers.notify(self.id, &keys);
    }
}

impl<T: Send + Sync> Source for StaticCollection<T> {
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
        self.store.read().len()
    }
}

impl<T: Send + Sync> Collection<T> for StaticCollection<T> {
    fn get(&self, key: &str) -> Option<Arc<T>> {
        self.store.read().get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<T>> {
        self.store.read().values().cloned().collect()
    }

    fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }
}
