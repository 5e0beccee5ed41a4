//! Answers which routes attach to which listeners of a gateway.

use crate::{delegation::flatten_route, refgrants::ReferenceGrants, routes::RoutesIndex};
use kgateway_translator_collections::{HandlerContext, StaticCollection};
use kgateway_translator_core::{
    gateway::{FromNamespaces, GatewayIr, Listener, Protocol, SecretRef},
    report::ReportMap,
    route::{HttpRouteRuleMatchIr, ParentRef, RouteIr},
    GroupKind, ObjectSource, CORE_GROUP,
};
use kgateway_translator_k8s_api::{Namespace, ResourceExt, Secret};
use std::{collections::BTreeMap, sync::Arc};

/// Why a route's parent reference attached to no listener.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no listener matches the parent reference")]
    NoMatchingParent,

    #[error("the route is not allowed by any listener")]
    NotAllowedByListeners,

    #[error("no listener hostname matches the route's hostnames")]
    NoMatchingListenerHostname,
}

/// A listener configuration problem found while admitting routes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    #[error("allowed routes use a namespace selector but no selector is set")]
    MissingSelector,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TlsError {
    #[error("certificate reference {0} is not permitted")]
    RefNotPermitted(ObjectSource),

    #[error("secret {0} not found")]
    NotFound(ObjectSource),

    #[error("unsupported certificate reference kind {0}")]
    InvalidKind(GroupKind),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// A route admitted by a listener.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteInfo {
    pub object: Arc<RouteIr>,
    pub parent_ref: ParentRef,
    /// The intersection of the route's and the listener's hostnames.
    pub hostnames: Vec<String>,
    /// Flattened rule matches. Empty for TCP and TLS routes.
    pub rules: Vec<HttpRouteRuleMatchIr>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListenerResult {
    pub routes: Vec<RouteInfo>,
    pub error: Option<ListenerError>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutesForGwResult {
    /// Keyed by listener name.
    pub listener_results: BTreeMap<String, ListenerResult>,
    pub route_errors: Vec<(ObjectSource, ParentRef, RouteError)>,
}

pub struct GatewayQueries {
    routes: Arc<RoutesIndex>,
    namespaces: Arc<StaticCollection<Namespace>>,
    secrets: Arc<StaticCollection<Secret>>,
    refgrants: Arc<ReferenceGrants>,
}

// === impl GatewayQueries ===

impl GatewayQueries {
    pub fn new(
        routes: Arc<RoutesIndex>,
        namespaces: Arc<StaticCollection<Namespace>>,
        secrets: Arc<StaticCollection<Secret>>,
        refgrants: Arc<ReferenceGrants>,
    ) -> Self {
        Self {
            routes,
            namespaces,
            secrets,
            refgrants,
        }
    }

    /// Evaluates every parent reference to `gw` against its listeners. Each
    /// parent reference is evaluated on its own; an error for one does not
    /// affect the others.
    pub fn routes_for_gateway(
        &self,
        ctx: &mut HandlerContext<'_>,
        gw: &GatewayIr,
        reports: &mut ReportMap,
    ) -> RoutesForGwResult {
        let mut result = RoutesForGwResult::default();
        for l in &gw.listeners {
            let entry = result.listener_results.entry(l.name.clone()).or_default();
            if let Some(ar) = &l.allowed_routes {
                if ar.namespaces == FromNamespaces::Selector(None) {
                    entry.error = Some(ListenerError::MissingSelector);
                }
            }
        }

        for route in self.routes.routes_for_gateway(ctx, &gw.source) {
            let route_ns = route.source().namespace.clone();
            let parent_refs = route
                .parent_refs()
                .iter()
                .filter(|p| {
                    p.group_kind() == GroupKind::gateway()
                        && p.namespace_or(&route_ns) == gw.source.namespace
                        && p.name == gw.source.name
                })
                .cloned()
                .collect::<Vec<_>>();

            for parent_ref in parent_refs {
                if let Err(error) =
                    self.admit(ctx, gw, &route, &parent_ref, &mut result, reports)
                {
                    tracing::debug!(route = %route.source(), parent = %parent_ref, %error, "Route not admitted");
                    result
                        .route_errors
                        .push((route.source().clone(), parent_ref, error));
                }
            }
        }
        result
    }

    fn admit(
        &self,
        ctx: &mut HandlerContext<'_>,
        gw: &GatewayIr,
        route: &Arc<RouteIr>,
        parent_ref: &ParentRef,
        result: &mut RoutesForGwResult,
        reports: &mut ReportMap,
    ) -> Result<(), RouteError> {
        let candidates = gw
            .listeners
            .iter()
            .filter(|l| {
                parent_ref.section_name.as_ref().is_none_or(|s| *s == l.name)
                    && parent_ref.port.is_none_or(|p| p == l.port)
            })
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(RouteError::NoMatchingParent);
        }

        let route_gk = route.group_kind();
        let route_ns = &route.source().namespace;
        let mut allowed = false;
        let mut rules = None;
        let mut attached = false;
        for l in candidates {
            if !allowed_kinds(l).contains(&route_gk) {
                continue;
            }
            if !self.namespace_allowed(ctx, l, &gw.source.namespace, route_ns) {
                continue;
            }
            allowed = true;

            let hostnames = match route.as_ref() {
                RouteIr::Tcp(_) => vec![],
                _ => match hostname_intersect(l.hostname.as_deref(), route.hostnames()) {
                    Some(hostnames) => hostnames,
                    None => continue,
                },
            };

            let rules = match route.as_ref() {
                RouteIr::Http(http) => rules
                    .get_or_insert_with(|| flatten_route(ctx, &self.routes, http, parent_ref, reports))
                    .clone(),
                _ => vec![],
            };

            attached = true;
            if let Some(entry) = result.listener_results.get_mut(&l.name) {
                entry.routes.push(RouteInfo {
                    object: route.clone(),
                    parent_ref: parent_ref.clone(),
                    hostnames,
                    rules,
                });
            }
        }

        if !allowed {
            return Err(RouteError::NotAllowedByListeners);
        }
        if !attached {
            return Err(RouteError::NoMatchingListenerHostname);
        }
        Ok(())
    }

    fn namespace_allowed(
        &self,
        ctx: &mut HandlerContext<'_>,
        l: &Listener,
        gw_ns: &str,
        route_ns: &str,
    ) -> bool {
        let from = l
            .allowed_routes
            .as_ref()
            .map(|ar| &ar.namespaces)
            .unwrap_or(&FromNamespaces::Same);
        match from {
            FromNamespaces::Same => gw_ns == route_ns,
            FromNamespaces::All => true,
            FromNamespaces::Selector(None) => false,
            FromNamespaces::Selector(Some(selector)) => {
                match ctx.fetch_one(self.namespaces.as_ref(), route_ns) {
                    Some(ns) => selector.matches(ns.labels()),
                    None => false,
                }
            }
        }
    }

    /// Fetches the secret named by a listener certificate reference. A secret
    /// in another namespace needs a grant for the gateway.
    pub fn get_secret_for_ref(
        &self,
        ctx: &mut HandlerContext<'_>,
        gw: &ObjectSource,
        r: &SecretRef,
    ) -> Result<Arc<Secret>, TlsError> {
        let group = r.group.as_deref().unwrap_or_default();
        let kind = r.kind.as_deref().unwrap_or("Secret");
        if !matches!(group, "" | CORE_GROUP) || kind != "Secret" {
            return Err(TlsError::InvalidKind(GroupKind::new(group, kind)));
        }

        let secret = ObjectSource::new(
            GroupKind::secret(),
            r.namespace.as_deref().unwrap_or(&gw.namespace),
            r.name.clone(),
        );
        if !self
            .refgrants
            .reference_allowed(ctx, &gw.group_kind(), &gw.namespace, &secret)
        {
            return Err(TlsError::RefNotPermitted(secret));
        }

        ctx.fetch_one(self.secrets.as_ref(), &secret.namespaced_name())
            .ok_or(TlsError::NotFound(secret))
    }
}

/// The route kinds a listener admits. Explicit kinds replace the protocol
/// defaults.
pub fn allowed_kinds(l: &Listener) -> Vec<GroupKind> {
    if let Some(kinds) = l.allowed_routes.as_ref().map(|ar| &ar.kinds) {
        if !kinds.is_empty() {
            return kinds.iter().map(GroupKind::normalized).collect();
        }
    }
    default_kinds(&l.protocol)
}

pub fn default_kinds(protocol: &Protocol) -> Vec<GroupKind> {
    match protocol {
        Protocol::Http | Protocol::Https => vec![GroupKind::http_route()],
        Protocol::Tcp => vec![GroupKind::tcp_route()],
        Protocol::Tls => vec![GroupKind::tls_route()],
        Protocol::Other(_) => vec![],
    }
}

/// Intersects a listener hostname with the hostnames of a route. Returns
/// `None` when nothing matches.
pub fn hostname_intersect(listener: Option<&str>, route: &[String]) -> Option<Vec<String>> {
    let listener = match listener {
        None | Some("") => {
            if route.is_empty() {
                return Some(vec!["*".to_string()]);
            }
            return Some(route.to_vec());
        }
        Some(l) => l,
    };
    if route.is_empty() {
        return Some(vec![listener.to_string()]);
    }

    let mut out = Vec::new();
    for host in route {
        let matched = if host == listener {
            Some(host.as_str())
        } else if let Some(suffix) = listener.strip_prefix('*') {
            // `*.foo.com` covers `bar.foo.com` and `*.bar.foo.com`; a route
            // wildcard that covers the listener keeps the listener's narrower
            // form.
            if host.ends_with(suffix) {
                Some(host.as_str())
            } else if host.starts_with('*') && wildcard_covers(host, listener) {
                Some(listener)
            } else {
                None
            }
        } else if host.starts_with('*') && wildcard_covers(host, listener) {
            Some(listener)
        } else {
            None
        };
        if let Some(h) = matched {
            if !out.iter().any(|o: &String| o == h) {
                out.push(h.to_string());
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Whether a wildcard hostname such as `*.com` covers `host`.
fn wildcard_covers(wildcard: &str, host: &str) -> bool {
    let Some(suffix) = wildcard.strip_prefix('*') else {
        return false;
    };
    host.ends_with(suffix) && host.len() > suffix.len()
}
