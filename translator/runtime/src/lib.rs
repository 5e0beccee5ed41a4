#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kgateway_translator_collections as collections;
pub use kgateway_translator_core as core;
pub use kgateway_translator_k8s_api as k8s;
pub use kgateway_translator_k8s_index as index;
pub use kgateway_translator_k8s_status as status;

mod args;
mod lease;
pub mod output;
mod reconcile;
mod settings;

pub use self::{args::Args, settings::Settings};
