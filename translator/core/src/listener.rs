//! The listener-level output of gateway translation.

use crate::{
    backend::BackendRefIr,
    policy::AttachedPolicies,
    route::{HttpRouteRuleMatchIr, ParentRef},
    ObjectSource,
};
use std::fmt;

/// Physical listeners bind to all addresses.
pub const BIND_ADDRESS: &str = "::";

/// A physical proxy listener. Many logical listeners may share one.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerIr {
    /// The `~`-joined names of the logical listeners merged into this one, in
    /// the order they were merged.
    pub name: String,
    pub bind_address: String,
    pub bind_port: u16,
    pub http_filter_chains: Vec<HttpFilterChainIr>,
    pub tcp_filter_chains: Vec<TcpIr>,
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterChainMatch {
    pub sni_domains: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterChainCommon {
    pub name: String,
    pub matcher: FilterChainMatch,
    pub tls: Option<TlsBundle>,
}

/// Certificate material for a terminating filter chain.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca: Vec<u8>,
    pub cert_chain: Vec<u8>,
    pub private_key: Vec<u8>,
    pub alpn_protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpFilterChainIr {
    pub common: FilterChainCommon,
    pub vhosts: Vec<VirtualHostIr>,
    pub attached_policies: AttachedPolicies,
    pub attached_network_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VirtualHostIr {
    pub name: String,
    pub hostname: String,
    pub rules: Vec<HttpRouteRuleMatchIr>,
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpIr {
    pub common: FilterChainCommon,
    /// The route that supplied the backends.
    pub route: ObjectSource,
    pub parent_ref: ParentRef,
    pub backends: Vec<BackendRefIr>,
}

// === impl ListenerIr ===

impl ListenerIr {
    pub fn new(name: impl Into<String>, bind_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_address: BIND_ADDRESS.to_string(),
            bind_port,
            http_filter_chains: Vec::new(),
            tcp_filter_chains: Vec::new(),
            attached_policies: AttachedPolicies::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http_filter_chains.is_empty() && self.tcp_filter_chains.is_empty()
    }
}

// === impl TlsBundle ===

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca", &self.ca.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_bundle_debug_redacts_the_key() {
        let bundle = TlsBundle {
            ca: vec![],
            cert_chain: b"cert".to_vec(),
            private_key: b"secret-key-material".to_vec(),
            alpn_protocols: vec!["h2".to_string()],
        };
        let debug = format!("{bundle:?}");
        assert!(!debug.contains("secret-key-material"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn new_listeners_bind_all_addresses() {
        let l = ListenerIr::new("http", 8080);
        assert_eq!(l.bind_address, "::");
        assert!(l.is_empty());
    }
}
