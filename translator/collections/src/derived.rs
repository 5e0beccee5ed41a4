use crate::{
    context::Dep, metrics::CollectionMetrics, source::Subscribers, Collection, Dependent,
    HandlerContext, Keyed, Source, SourceId, Synced,
};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, OnceLock, Weak},
};

type MapFn<I, O> = Box<dyn Fn(&mut HandlerContext<'_>, &I) -> Vec<O> + Send + Sync>;

/// A collection computed from an input collection by a mapping function.
///
/// Each input key is mapped independently. The dependencies a mapping
/// function reads through its [`HandlerContext`] are recorded per input key,
/// so a change in a dependency only recomputes the input keys that read it.
pub struct Derived<I, O> {
    id: SourceId,
    name: String,
    input: Arc<dyn Collection<I>>,
    map: MapFn<I, O>,
    dependent: Weak<dyn Dependent>,

    /// Serializes recomputation. The output store is only written while this
    /// lock is held.
    state: Mutex<State>,
    store: RwLock<AHashMap<String, Arc<O>>>,

    synced: Synced,
    subscribers: Subscribers,
    metrics: OnceLock<CollectionMetrics>,
}

#[derive(Default)]
struct State {
    outputs_by_input: HashMap<String, Vec<String>>,
    owner_by_output: HashMap<String, String>,
    deps_by_input: HashMap<String, Vec<Dep>>,
    dependents: HashMap<Dep, HashSet<String>>,
    subscribed: HashSet<SourceId>,
    pending: HashMap<SourceId, Synced>,
}

/// The input of collections that are computed from nothing.
struct Singleton {
    id: SourceId,
    synced: Synced,
}

const SINGLETON_KEY: &str = "";

// === impl Derived ===

impl<I, O> Derived<I, O>
where
    I: Send + Sync + 'static,
    O: Keyed + PartialEq + Send + Sync + 'static,
{
    /// Maps each input to at most one output.
    pub fn map<C, F>(name: impl Into<String>, input: Arc<C>, f: F) -> Arc<Self>
    where
        C: Collection<I> + ?Sized + 'static,
        F: Fn(&mut HandlerContext<'_>, &I) -> Option<O> + Send + Sync + 'static,
    {
        Self::build(
            name.into(),
            Arc::new(input),
            Box::new(move |ctx, i| f(ctx, i).into_iter().collect()),
        )
    }

    /// Maps each input to any number of outputs.
    pub fn many<C, F>(name: impl Into<String>, input: Arc<C>, f: F) -> Arc<Self>
    where
        C: Collection<I> + ?Sized + 'static,
        F: Fn(&mut HandlerContext<'_>, &I) -> Vec<O> + Send + Sync + 'static,
    {
        Self::build(name.into(), Arc::new(input), Box::new(f))
    }

    fn build(name: String, input: Arc<dyn Collection<I>>, map: MapFn<I, O>) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak: &Weak<Self>| {
            let dependent: Weak<dyn Dependent> = weak.clone();
            let mut state = State::default();
            state.subscribed.insert(input.id());
            state.pending.insert(input.id(), input.synced().clone());
            Self {
                id: SourceId::next(),
                name,
                input,
                map,
                dependent,
                state: Mutex::new(state),
                store: RwLock::new(AHashMap::new()),
                synced: Synced::new(),
                subscribers: Subscribers::default(),
                metrics: OnceLock::new(),
            }
        });

        // Subscribe before the initial pass so that no change to the input is
        // missed between the two.
        this.input.subscribe(this.dependent.clone());
        this.recompute(this.input.keys());
        this.check_synced();
        this
    }

    pub fn with_metrics(self: Arc<Self>, metrics: &CollectionMetrics) -> Arc<Self> {
        if self.metrics.set(metrics.clone()).is_ok() {
            metrics.set_size(&self.name, self.len());
            if self.has_synced() {
                metrics.set_synced(&self.name);
            }
        }
        self
    }

    fn recompute(&self, keys: impl IntoIterator<Item = String>) {
        let changed = {
            let mut state = self.state.lock();
            let mut changed = BTreeSet::new();
            for key in keys {
                self.recompute_key(&mut state, key, &mut changed);
            }
            changed
        };

        if let Some(m) = self.metrics.get() {
            m.set_size(&self.name, self.len());
        }
        if !changed.is_empty() {
            let keys = changed.into_iter().collect::<Vec<_>>();
            tracing::trace!(collection = %self.name, changed = keys.len(), "Recomputed");
            self.subscribers.notify(self.id, &keys);
        }
    }

    fn recompute_key(&self, state: &mut State, key: String, changed: &mut BTreeSet<String>) {
        let State {
            subscribed,
            pending,
            ..
        } = state;
        let mut ctx = HandlerContext::new(&self.dependent, subscribed, pending);
        let outputs = match self.input.get(&key) {
            Some(input) => (self.map)(&mut ctx, &input),
            None => Vec::new(),
        };
        let deps = ctx.into_deps();
        if let Some(m) = self.metrics.get() {
            m.inc_recomputes(&self.name);
        }

        // Replace the reverse dependency edges of this key.
        if let Some(old) = state.deps_by_input.remove(&key) {
            for dep in old {
                if let Some(keys) = state.dependents.get_mut(&dep) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        state.dependents.remove(&dep);
                    }
                }
            }
        }
        if !deps.is_empty() {
            for dep in &deps {
                state
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(key.clone());
            }
            state.deps_by_input.insert(key.clone(), deps);
        }

        let new_keys = outputs.iter().map(|o| o.key()).collect::<Vec<_>>();
        let old_keys = state.outputs_by_input.remove(&key).unwrap_or_default();

        let mut store = self.store.write();
        for old in old_keys {
            if new_keys.contains(&old) {
                continue;
            }
            // Another input may have since claimed the key.
            if state.owner_by_output.get(&old) == Some(&key) {
                state.owner_by_output.remove(&old);
                if store.remove(&old).is_some() {
                    changed.insert(old);
                }
            }
        }
        for (out_key, out) in new_keys.iter().zip(outputs) {
            state.owner_by_output.insert(out_key.clone(), key.clone());
            match store.get(out_key) {
                Some(prev) if **prev == out => {}
                _ => {
                    store.insert(out_key.clone(), Arc::new(out));
                    changed.insert(out_key.clone());
                }
            }
        }
        drop(store);

        if !new_keys.is_empty() {
            state.outputs_by_input.insert(key, new_keys);
        }
    }

    fn check_synced(&self) {
        let ready = {
            let mut state = self.state.lock();
            state.pending.retain(|_, synced| !synced.has_synced());
            state.pending.is_empty()
        };
        if ready && self.synced.mark() {
            tracing::debug!(collection = %self.name, size = self.len(), "Synced");
            if let Some(m) = self.metrics.get() {
                m.set_synced(&self.name);
            }
            self.subscribers.notify_synced(self.id);
        }
    }
}

impl<O> Derived<(), O>
where
    O: Keyed + PartialEq + Send + Sync + 'static,
{
    /// A collection of at most one value that depends only on what its
    /// mapping function fetches.
    pub fn from_nothing<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: Fn(&mut HandlerContext<'_>) -> Option<O> + Send + Sync + 'static,
    {
        Self::map(name, Singleton::shared(), move |ctx, _: &()| f(ctx))
    }

    /// A collection of any number of values that depends only on what its
    /// mapping function fetches.
    pub fn many_from_nothing<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: Fn(&mut HandlerContext<'_>) -> Vec<O> + Send + Sync + 'static,
    {
        Self::many(name, Singleton::shared(), move |ctx, _: &()| f(ctx))
    }
}

impl<I, O> Dependent for Derived<I, O>
where
    I: Send + Sync + 'static,
    O: Keyed + PartialEq + Send + Sync + 'static,
{
    fn on_change(&self, source: SourceId, keys: &[String]) {
        let mut affected = BTreeSet::new();
        if source == self.input.id() {
            affected.extend(keys.iter().cloned());
        }
        {
            let state = self.state.lock();
            if let Some(inputs) = state.dependents.get(&(source, None)) {
                affected.extend(inputs.iter().cloned());
            }
            for key in keys {
                if let Some(inputs) = state.dependents.get(&(source, Some(key.clone()))) {
                    affected.extend(inputs.iter().cloned());
                }
            }
        }
        if !affected.is_empty() {
            self.recompute(affected);
        }
    }

    fn on_synced(&self, _: SourceId) {
        self.check_synced();
    }
}

impl<I: Send + Sync, O: Send + Sync> Source for Derived<I, O> {
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

impl<I: Send + Sync, O: Send + Sync> Collection<O> for Derived<I, O> {
    fn get(&self, key: &str) -> Option<Arc<O>> {
        self.store.read().get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<O>> {
        self.store.read().values().cloned().collect()
    }

    fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }
}

// === impl Singleton ===

impl Singleton {
    fn shared() -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::next(),
            synced: Synced::ready(),
        })
    }
}

impl Source for Singleton {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        "singleton"
    }

    fn synced(&self) -> &Synced {
        &self.synced
    }

    fn subscribe(&self, _: Weak<dyn Dependent>) {}

    fn len(&self) -> usize {
        1
    }
}

impl Collection<()> for Singleton {
    fn get(&self, key: &str) -> Option<Arc<()>> {
        (key == SINGLETON_KEY).then(|| Arc::new(()))
    }

    fn list(&self) -> Vec<Arc<()>> {
        vec![Arc::new(())]
    }

    fn keys(&self) -> Vec<String> {
        vec![SINGLETON_KEY.to_string()]
    }
}
