//! Writes the status of Gateways and routes.
//!
//! Translation produces a [`ReportMap`](kgateway_translator_core::report::ReportMap)
//! per Gateway. The [`Index`] turns the merged reports into statuses and
//! queues a merge patch for each object whose status changed. The
//! [`Controller`] applies queued patches. Both only act while this process
//! holds the status write lease, so that a single replica writes status.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conditions;
mod controller;
mod gateway;
mod index;
mod metrics;
mod routes;


pub use self::{
    controller::{Controller, PatchError, FIELD_MANAGER},
    gateway::gateway_status,
    index::{Index, SharedIndex, Sources, Update},
    metrics::{ControllerMetrics, IndexMetrics},
    routes::{parent_reference, route_status},
};
