use crate::{
    backend::BackendRefIr, policy::AttachedPolicies, GroupKind, ObjectSource, Time,
    GATEWAY_GROUP,
};
use kgateway_translator_collections::Keyed;
use std::{fmt, sync::Arc};

/// A route's reference to the resource it attaches to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentRef {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathMatch {
    Exact(String),
    PathPrefix(String),
    RegularExpression(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StringMatchKind {
    Exact,
    RegularExpression,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
    pub kind: StringMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryParamMatch {
    pub name: String,
    pub value: String,
    pub kind: StringMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HttpRouteMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub method: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderModifier {
    pub set: Vec<(String, String)>,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestRedirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<PathModifier>,
    pub port: Option<u16>,
    pub status_code: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UrlRewrite {
    pub hostname: Option<String>,
    pub path: Option<PathModifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathModifier {
    ReplaceFullPath(String),
    ReplacePrefixMatch(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpRouteFilter {
    RequestHeaderModifier(HeaderModifier),
    ResponseHeaderModifier(HeaderModifier),
    RequestRedirect(RequestRedirect),
    UrlRewrite(UrlRewrite),
    RequestMirror(BackendRefIr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteIr {
    pub source: ObjectSource,
    pub creation: Option<Time>,
    /// The object's `metadata.generation`. Builtin filters compare as always
    /// equal, so spec changes are detected through this field.
    pub generation: Option<i64>,
    pub parent_refs: Vec<ParentRef>,
    pub hostnames: Vec<String>,
    pub rules: Vec<HttpRouteRuleIr>,
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteRuleIr {
    pub name: Option<String>,
    pub matches: Vec<HttpRouteMatch>,
    pub backends: Vec<HttpBackendOrDelegate>,
    /// Builtin policies derived from the rule's own filters.
    pub extension_refs: AttachedPolicies,
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpBackendOrDelegate {
    Backend(HttpBackend),
    Delegate(DelegateRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpBackend {
    pub backend: BackendRefIr,
    pub attached_policies: AttachedPolicies,
}

/// A rule's reference to child HTTPRoutes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DelegateRef {
    pub namespace: String,
    /// `None` selects every HTTPRoute in the namespace.
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpRouteIr {
    pub source: ObjectSource,
    pub creation: Option<Time>,
    pub generation: Option<i64>,
    pub parent_refs: Vec<ParentRef>,
    pub backends: Vec<BackendRefIr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TlsRouteIr {
    pub source: ObjectSource,
    pub creation: Option<Time>,
    pub generation: Option<i64>,
    pub parent_refs: Vec<ParentRef>,
    pub hostnames: Vec<String>,
    pub backends: Vec<BackendRefIr>,
}

/// A route of any supported kind.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteIr {
    Http(Arc<HttpRouteIr>),
    Tcp(Arc<TcpRouteIr>),
    Tls(Arc<TlsRouteIr>),
}

/// A single match of a route rule, after delegation has been resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteRuleMatchIr {
    pub name: String,
    /// The route that declares the rule. For delegated rules this is the
    /// child route.
    pub parent: Arc<HttpRouteIr>,
    /// The parent reference through which the rule reached the gateway.
    pub parent_ref: ParentRef,
    /// The routes traversed to reach this rule, starting at the root.
    pub delegation_chain: Vec<ObjectSource>,
    pub rule_index: usize,
    pub match_index: usize,
    pub matcher: HttpRouteMatch,
    pub backends: Vec<HttpBackend>,
    pub extension_refs: AttachedPolicies,
    pub attached_policies: AttachedPolicies,
}

impl Keyed for HttpRouteIr {
    fn key(&self) -> String {
        self.source.namespaced_name()
    }
}

impl Keyed for RouteIr {
    fn key(&self) -> String {
        self.resource_name()
    }
}

// === impl ParentRef ===

impl ParentRef {
    pub fn gateway(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            group: Some(GATEWAY_GROUP.to_string()),
            kind: Some("Gateway".to_string()),
            namespace: namespace.map(Into::into),
            name: name.into(),
            section_name: None,
            port: None,
        }
    }

    /// The group/kind of the parent, applying the Gateway API defaults.
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(
            self.group.as_deref().unwrap_or(GATEWAY_GROUP),
            self.kind.as_deref().unwrap_or("Gateway"),
        )
    }

    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.group_kind())?;
        if let Some(ns) = &self.namespace {
            write!(f, "/{ns}")?;
        }
        write!(f, "/{}", self.name)?;
        if let Some(section) = &self.section_name {
            write!(f, "#{section}")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

// === impl HttpRouteMatch ===

impl Default for HttpRouteMatch {
    fn default() -> Self {
        Self {
            path: PathMatch::PathPrefix("/".to_string()),
            headers: Vec::new(),
            query_params: Vec::new(),
            method: None,
        }
    }
}

impl PathMatch {
    pub fn value(&self) -> &str {
        match self {
            Self::Exact(v) | Self::PathPrefix(v) | Self::RegularExpression(v) => v,
        }
    }
}

// === impl DelegateRef ===

impl DelegateRef {
    pub fn new(namespace: impl Into<String>, name: &str) -> Self {
        let name = match name {
            "" | "*" => None,
            name => Some(name.to_string()),
        };
        Self {
            namespace: namespace.into(),
            name,
        }
    }

    pub fn selects_all(&self) -> bool {
        self.name.is_none()
    }
}

impl fmt::Display for DelegateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTPRoute/{}/{}",
            self.namespace,
            self.name.as_deref().unwrap_or("*")
        )
    }
}

// === impl RouteIr ===

impl RouteIr {
    pub fn source(&self) -> &ObjectSource {
        match self {
            Self::Http(r) => &r.source,
            Self::Tcp(r) => &r.source,
            Self::Tls(r) => &r.source,
        }
    }

    pub fn creation(&self) -> Option<&Time> {
        match self {
            Self::Http(r) => r.creation.as_ref(),
            Self::Tcp(r) => r.creation.as_ref(),
            Self::Tls(r) => r.creation.as_ref(),
        }
    }

    pub fn generation(&self) -> Option<i64> {
        match self {
            Self::Http(r) => r.generation,
            Self::Tcp(r) => r.generation,
            Self::Tls(r) => r.generation,
        }
    }

    pub fn parent_refs(&self) -> &[ParentRef] {
        match self {
            Self::Http(r) => &r.parent_refs,
            Self::Tcp(r) => &r.parent_refs,
            Self::Tls(r) => &r.parent_refs,
        }
    }

    pub fn hostnames(&self) -> &[String] {
        match self {
            Self::Http(r) => &r.hostnames,
            Self::Tls(r) => &r.hostnames,
            Self::Tcp(_) => &[],
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        match self {
            Self::Http(_) => GroupKind::http_route(),
            Self::Tcp(_) => GroupKind::tcp_route(),
            Self::Tls(_) => GroupKind::tls_route(),
        }
    }

    pub fn resource_name(&self) -> String {
        self.source().resource_name()
    }
}
