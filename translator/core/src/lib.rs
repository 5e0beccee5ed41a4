#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod endpoints;
pub mod gateway;
mod hash;
pub mod listener;
mod object;
pub mod plugin;
pub mod policy;
pub mod report;
pub mod route;

pub use self::{
    hash::{hash_labels, stable_hasher},
    object::{GroupKind, ObjectSource, CORE_GROUP, GATEWAY_GROUP},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub const GATEWAY_CONTROLLER_NAME: &str = "kgateway.dev/kgateway";

/// Separates the components of composite resource names, e.g. virtual host
/// names (`parent~host`) and merged listener names.
pub const KEY_DELIMITER: &str = "~";
