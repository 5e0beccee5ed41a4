//! The subset of the Gateway API that is translated.

mod gateway;
mod gateway_class;
mod httproute;
mod reference_grant;
mod shared;
mod tcproute;
mod tlsroute;

pub use self::{
    gateway::*, gateway_class::*, httproute::*, reference_grant::*, shared::*, tcproute::*,
    tlsroute::*,
};

pub const GROUP: &str = "gateway.networking.k8s.io";
