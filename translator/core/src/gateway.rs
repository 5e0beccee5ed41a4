use crate::{policy::AttachedPolicies, ObjectSource};
use kgateway_translator_collections::Keyed;
use kgateway_translator_k8s_api::labels::Selector;
use std::fmt;

/// A Gateway, reduced to what listener translation needs.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayIr {
    pub source: ObjectSource,
    pub gateway_class_name: String,
    pub listeners: Vec<Listener>,
    pub attached_policies: AttachedPolicies,
    pub attached_http_policies: AttachedPolicies,
}

/// A logical listener, as declared on a Gateway.
#[derive(Clone, Debug, PartialEq)]
pub struct Listener {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub hostname: Option<String>,
    pub tls: Option<ListenerTls>,
    pub allowed_routes: Option<AllowedRoutes>,
    pub attached_policies: AttachedPolicies,
    /// The gateway that declares the listener.
    pub parent: ObjectSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Tls,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerTls {
    pub mode: TlsMode,
    pub certificate_refs: Vec<SecretRef>,
    pub options: Vec<(String, String)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TlsMode {
    Terminate,
    Passthrough,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
}

/// The route admission policy of a listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedRoutes {
    pub namespaces: FromNamespaces,
    /// Explicitly allowed route kinds; empty means the protocol default.
    pub kinds: Vec<crate::GroupKind>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FromNamespaces {
    Same,
    All,
    /// Namespaces whose labels match the selector. `None` when the listener
    /// declares `Selector` without providing one.
    Selector(Option<Selector>),
}

impl Keyed for GatewayIr {
    fn key(&self) -> String {
        self.source.namespaced_name()
    }
}

// === impl Protocol ===

impl From<&str> for Protocol {
    fn from(p: &str) -> Self {
        match p {
            "HTTP" => Self::Http,
            "HTTPS" => Self::Https,
            "TCP" => Self::Tcp,
            "TLS" => Self::Tls,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
            Self::Https => f.write_str("HTTPS"),
            Self::Tcp => f.write_str("TCP"),
            Self::Tls => f.write_str("TLS"),
            Self::Other(p) => f.write_str(p),
        }
    }
}
