//! Incrementally maintained collections.
//!
//! Watched resources enter through [`StaticCollection`]s. Everything else is a
//! [`Derived`] collection whose entries are computed from an input collection
//! by a mapping function. Mapping functions read any other state through a
//! [`HandlerContext`], which records each read as a dependency of the input
//! key being computed:
//!
//! ```text
//! [ StaticCollection<Service> ] --> [ Derived<Service, Backend> ] --> [ Derived<Backend, Endpoints> ]
//!                                                                         ^
//! [ StaticCollection<EndpointSlice> ] --> [ Index by service ] -----------+
//! ```
//!
//! When a collection changes, it notifies its dependents with the set of keys
//! that changed. A derived collection recomputes only the input keys whose
//! recorded dependencies intersect that set, and republishes only the outputs
//! that are not equal to their previous value.
//!
//! Recomputation is synchronous: it runs on the task that applied the
//! originating change. A panic in a mapping function unwinds through that
//! task, so the driver of the watch observes the failure.
//!
//! Each collection has a [`Synced`] signal. Static collections are synced once
//! their watch has delivered its initial list. Derived collections, indices
//! and joins are synced once every source they depend on is synced.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod changes;
mod context;
mod derived;
mod index;
mod join;
pub mod metrics;
mod source;
mod static_collection;
mod synced;
mod trigger;


pub use self::{
    changes::{changes, Changes},
    context::HandlerContext,
    derived::Derived,
    index::Index,
    join::Join,
    source::{Dependent, Source, SourceId},
    static_collection::{resource_key, StaticCollection},
    synced::{wait_for_all, Synced},
    trigger::RecomputeTrigger,
};
use std::sync::Arc;

/// A keyed set of values.
pub trait Collection<T>: Source {
    fn get(&self, key: &str) -> Option<Arc<T>>;

    fn list(&self) -> Vec<Arc<T>>;

    fn keys(&self) -> Vec<String>;
}

/// Values that know the key they are stored under.
pub trait Keyed {
    fn key(&self) -> String;
}

impl<T: Keyed> Keyed for Arc<T> {
    fn key(&self) -> String {
        self.as_ref().key()
    }
}

impl<S: Source + ?Sized> Source for Arc<S> {
    fn id(&self) -> SourceId {
        (**self).id()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn synced(&self) -> &Synced {
        (**self).synced()
    }

    fn subscribe(&self, dependent: std::sync::Weak<dyn Dependent>) {
        (**self).subscribe(dependent)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl<T, C: Collection<T> + ?Sized> Collection<T> for Arc<C> {
    fn get(&self, key: &str) -> Option<Arc<T>> {
        (**self).get(key)
    }

    fn list(&self) -> Vec<Arc<T>> {
        (**self).list()
    }

    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }
}
