use crate::{
    backends::{backend_ref, weight, BackendIndex},
    policies::PolicyIndex,
};
use kgateway_translator_collections::{
    Collection, Derived, HandlerContext, Index, Join, StaticCollection,
};
use kgateway_translator_core::{
    backend::BackendRefIr,
    plugin::{builtin_group_kind, BuiltinFilters},
    policy::{AttachedPolicies, PolicyAtt},
    route::{
        DelegateRef, HeaderMatch, HeaderModifier, HttpBackend, HttpBackendOrDelegate,
        HttpRouteFilter, HttpRouteIr, HttpRouteMatch, HttpRouteRuleIr, ParentRef, PathMatch,
        PathModifier, QueryParamMatch, RequestRedirect, RouteIr, StringMatchKind, TcpRouteIr,
        TlsRouteIr, UrlRewrite,
    },
    GroupKind, ObjectSource, GATEWAY_GROUP,
};
use kgateway_translator_k8s_api::{gateway_api as api, ResourceExt};
use std::sync::Arc;

/// Every route of a supported kind, translated to IR, with indices for
/// gateway attachment and delegation.
pub struct RoutesIndex {
    routes: Arc<Join<RouteIr>>,
    by_gateway: Arc<Index<RouteIr>>,
    http_by_namespace: Arc<Index<RouteIr>>,
}

#[derive(Clone)]
pub struct RouteInputs {
    pub http_routes: Arc<StaticCollection<api::HttpRoute>>,
    pub tcp_routes: Arc<StaticCollection<api::TcpRoute>>,
    pub tls_routes: Arc<StaticCollection<api::TlsRoute>>,
}

/// Translates a route's source objects with access to the backend and
/// policy indices.
#[derive(Clone)]
struct RouteTranslator {
    backends: Arc<BackendIndex>,
    policies: Arc<PolicyIndex>,
}

// === impl RoutesIndex ===

impl RoutesIndex {
    pub fn new(inputs: RouteInputs, backends: Arc<BackendIndex>, policies: Arc<PolicyIndex>) -> Self {
        let translator = RouteTranslator { backends, policies };

        let http = {
            let t = translator.clone();
            Derived::map("http-routes", inputs.http_routes, move |ctx, route: &api::HttpRoute| {
                Some(RouteIr::Http(Arc::new(t.http_route(ctx, route))))
            })
        };
        let tcp = {
            let t = translator.clone();
            Derived::map("tcp-routes", inputs.tcp_routes, move |ctx, route: &api::TcpRoute| {
                Some(RouteIr::Tcp(Arc::new(t.tcp_route(ctx, route))))
            })
        };
        let tls = Derived::map("tls-routes", inputs.tls_routes, move |ctx, route: &api::TlsRoute| {
            Some(RouteIr::Tls(Arc::new(translator.tls_route(ctx, route))))
        });

        let routes = Join::new(
            "routes",
            vec![
                http as Arc<dyn Collection<RouteIr>>,
                tcp as Arc<dyn Collection<RouteIr>>,
                tls as Arc<dyn Collection<RouteIr>>,
            ],
        );
        let by_gateway = Index::new("routes-by-gateway", routes.clone(), gateway_keys);
        let http_by_namespace = Index::new("http-routes-by-namespace", routes.clone(), |r: &RouteIr| {
            match r {
                RouteIr::Http(r) => vec![r.source.namespace.clone()],
                _ => vec![],
            }
        });

        Self {
            routes,
            by_gateway,
            http_by_namespace,
        }
    }

    pub fn routes(&self) -> &Arc<Join<RouteIr>> {
        &self.routes
    }

    /// Routes with a parent reference to the gateway `namespace/name`.
    pub fn routes_for_gateway(
        &self,
        ctx: &mut HandlerContext<'_>,
        gateway: &ObjectSource,
    ) -> Vec<Arc<RouteIr>> {
        let mut routes = ctx.fetch_index(&self.by_gateway, &gateway.namespaced_name());
        routes.sort_by(|a, b| a.source().cmp(b.source()));
        routes
    }

    pub fn fetch_http_route(
        &self,
        ctx: &mut HandlerContext<'_>,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<HttpRouteIr>> {
        let key = ObjectSource::new(GroupKind::http_route(), namespace, name).resource_name();
        match ctx.fetch_one(self.routes.as_ref(), &key)?.as_ref() {
            RouteIr::Http(route) => Some(route.clone()),
            _ => None,
        }
    }

    /// All HTTPRoutes in a namespace, ordered by name.
    pub fn http_routes_in_namespace(
        &self,
        ctx: &mut HandlerContext<'_>,
        namespace: &str,
    ) -> Vec<Arc<HttpRouteIr>> {
        let mut routes = ctx
            .fetch_index(&self.http_by_namespace, namespace)
            .into_iter()
            .filter_map(|r| match r.as_ref() {
                RouteIr::Http(route) => Some(route.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        routes.sort_by(|a, b| a.source.name.cmp(&b.source.name));
        routes
    }
}

fn gateway_keys(route: &RouteIr) -> Vec<String> {
    let ns = &route.source().namespace;
    let mut keys = route
        .parent_refs()
        .iter()
        .filter(|p| p.group_kind() == GroupKind::gateway())
        .map(|p| format!("{}/{}", p.namespace_or(ns), p.name))
        .collect::<Vec<_>>();
    keys.dedup();
    keys
}

pub fn parent_ref(p: &api::ParentReference) -> ParentRef {
    ParentRef {
        group: p.group.clone(),
        kind: p.kind.clone(),
        namespace: p.namespace.clone(),
        name: p.name.clone(),
        section_name: p.section_name.clone(),
        port: p.port.and_then(|p| u16::try_from(p).ok()),
    }
}

fn source<K: kube::Resource>(gk: GroupKind, obj: &K) -> ObjectSource {
    ObjectSource::new(
        gk,
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

// === impl RouteTranslator ===

impl RouteTranslator {
    fn http_route(&self, ctx: &mut HandlerContext<'_>, route: &api::HttpRoute) -> HttpRouteIr {
        let src = source(GroupKind::http_route(), route);
        let rules = route
            .spec
            .rules
            .iter()
            .flatten()
            .map(|rule| self.http_rule(ctx, &src, rule))
            .collect();
        HttpRouteIr {
            attached_policies: self.policies.policies_for(ctx, &src, None),
            creation: route.creation_timestamp(),
            generation: route.metadata.generation,
            parent_refs: route.spec.parent_refs.iter().flatten().map(parent_ref).collect(),
            hostnames: route.spec.hostnames.clone().unwrap_or_default(),
            rules,
            source: src,
        }
    }

    fn http_rule(
        &self,
        ctx: &mut HandlerContext<'_>,
        src: &ObjectSource,
        rule: &api::HttpRouteRule,
    ) -> HttpRouteRuleIr {
        let mut matches = rule
            .matches
            .iter()
            .flatten()
            .map(route_match)
            .collect::<Vec<_>>();
        if matches.is_empty() {
            matches.push(HttpRouteMatch::default());
        }

        let backends = rule
            .backend_refs
            .iter()
            .flatten()
            .map(|b| self.http_backend(ctx, src, b))
            .collect();

        let attached_policies = match rule.name.as_deref() {
            Some(name) => self.policies.policies_for(ctx, src, Some(name)),
            None => AttachedPolicies::default(),
        };

        HttpRouteRuleIr {
            name: rule.name.clone(),
            matches,
            backends,
            extension_refs: self.extension_refs(ctx, src, rule.filters.as_deref().unwrap_or_default()),
            attached_policies,
        }
    }

    fn http_backend(
        &self,
        ctx: &mut HandlerContext<'_>,
        src: &ObjectSource,
        b: &api::HttpBackendRef,
    ) -> HttpBackendOrDelegate {
        let inner = &b.backend_ref.inner;
        if is_http_route_ref(inner) {
            let ns = inner.namespace.as_deref().unwrap_or(&src.namespace);
            return HttpBackendOrDelegate::Delegate(DelegateRef::new(ns, &inner.name));
        }

        HttpBackendOrDelegate::Backend(HttpBackend {
            backend: self.backends.resolve(
                ctx,
                src,
                &backend_ref(inner),
                weight(b.backend_ref.weight),
            ),
            attached_policies: self.extension_refs(ctx, src, b.filters.as_deref().unwrap_or_default()),
        })
    }

    /// Inline filters are collected into a single builtin policy. Extension
    /// references are resolved against the policy index.
    fn extension_refs(
        &self,
        ctx: &mut HandlerContext<'_>,
        src: &ObjectSource,
        filters: &[api::HttpRouteFilter],
    ) -> AttachedPolicies {
        let mut out = AttachedPolicies::default();
        let mut builtins = Vec::new();
        for filter in filters {
            match filter {
                api::HttpRouteFilter::ExtensionRef { extension_ref } => {
                    let policy = ObjectSource::new(
                        GroupKind::new(extension_ref.group.clone(), extension_ref.kind.clone()),
                        src.namespace.clone(),
                        extension_ref.name.clone(),
                    );
                    match self.policies.fetch_policy(ctx, &policy) {
                        Some(att) => out.push(att),
                        None => tracing::debug!(route = %src, %policy, "Extension reference not found"),
                    }
                }
                filter => builtins.push(self.builtin_filter(ctx, src, filter)),
            }
        }
        if !builtins.is_empty() {
            out.push(PolicyAtt::new(
                builtin_group_kind(),
                Arc::new(BuiltinFilters(builtins.into_iter().flatten().collect())),
            ));
        }
        out
    }

    fn builtin_filter(
        &self,
        ctx: &mut HandlerContext<'_>,
        src: &ObjectSource,
        filter: &api::HttpRouteFilter,
    ) -> Option<HttpRouteFilter> {
        let f = match filter {
            api::HttpRouteFilter::RequestHeaderModifier {
                request_header_modifier,
            } => HttpRouteFilter::RequestHeaderModifier(header_modifier(request_header_modifier)),
            api::HttpRouteFilter::ResponseHeaderModifier {
                response_header_modifier,
            } => HttpRouteFilter::ResponseHeaderModifier(header_modifier(response_header_modifier)),
            api::HttpRouteFilter::RequestRedirect { request_redirect } => {
                HttpRouteFilter::RequestRedirect(RequestRedirect {
                    scheme: request_redirect.scheme.clone(),
                    hostname: request_redirect.hostname.clone(),
                    path: request_redirect.path.as_ref().and_then(path_modifier),
                    port: request_redirect.port.and_then(|p| u16::try_from(p).ok()),
                    status_code: request_redirect
                        .status_code
                        .and_then(|c| u16::try_from(c).ok()),
                })
            }
            api::HttpRouteFilter::UrlRewrite { url_rewrite } => HttpRouteFilter::UrlRewrite(UrlRewrite {
                hostname: url_rewrite.hostname.clone(),
                path: url_rewrite.path.as_ref().and_then(path_modifier),
            }),
            api::HttpRouteFilter::RequestMirror { request_mirror } => {
                let backend = self.backends.resolve(
                    ctx,
                    src,
                    &backend_ref(&request_mirror.backend_ref),
                    1,
                );
                HttpRouteFilter::RequestMirror(backend)
            }
            api::HttpRouteFilter::ExtensionRef { .. } => return None,
        };
        Some(f)
    }

    fn tcp_route(&self, ctx: &mut HandlerContext<'_>, route: &api::TcpRoute) -> TcpRouteIr {
        let src = source(GroupKind::tcp_route(), route);
        TcpRouteIr {
            backends: self.backends_of(ctx, &src, route.spec.rules.iter().flat_map(|r| &r.backend_refs)),
            creation: route.creation_timestamp(),
            generation: route.metadata.generation,
            parent_refs: route.spec.parent_refs.iter().flatten().map(parent_ref).collect(),
            source: src,
        }
    }

    fn tls_route(&self, ctx: &mut HandlerContext<'_>, route: &api::TlsRoute) -> TlsRouteIr {
        let src = source(GroupKind::tls_route(), route);
        TlsRouteIr {
            backends: self.backends_of(ctx, &src, route.spec.rules.iter().flat_map(|r| &r.backend_refs)),
            creation: route.creation_timestamp(),
            generation: route.metadata.generation,
            parent_refs: route.spec.parent_refs.iter().flatten().map(parent_ref).collect(),
            hostnames: route.spec.hostnames.clone().unwrap_or_default(),
            source: src,
        }
    }

    fn backends_of<'r>(
        &self,
        ctx: &mut HandlerContext<'_>,
        src: &ObjectSource,
        refs: impl Iterator<Item = &'r api::BackendRef>,
    ) -> Vec<BackendRefIr> {
        refs.map(|r| self.backends.resolve(ctx, src, &backend_ref(&r.inner), weight(r.weight)))
            .collect()
    }
}

fn is_http_route_ref(r: &api::BackendObjectReference) -> bool {
    r.group.as_deref() == Some(GATEWAY_GROUP) && r.kind.as_deref() == Some("HTTPRoute")
}

fn route_match(m: &api::HttpRouteMatch) -> HttpRouteMatch {
    let path = match &m.path {
        None => PathMatch::PathPrefix("/".to_string()),
        Some(p) => {
            let value = p.value.clone().unwrap_or_else(|| "/".to_string());
            match p.r#type.as_deref() {
                Some("Exact") => PathMatch::Exact(value),
                Some("RegularExpression") => PathMatch::RegularExpression(value),
                _ => PathMatch::PathPrefix(value),
            }
        }
    };
    HttpRouteMatch {
        path,
        headers: m
            .headers
            .iter()
            .flatten()
            .map(|h| HeaderMatch {
                name: h.name.clone(),
                value: h.value.clone(),
                kind: string_match_kind(h.r#type.as_deref()),
            })
            .collect(),
        query_params: m
            .query_params
            .iter()
            .flatten()
            .map(|q| QueryParamMatch {
                name: q.name.clone(),
                value: q.value.clone(),
                kind: string_match_kind(q.r#type.as_deref()),
            })
            .collect(),
        method: m.method.clone(),
    }
}

fn string_match_kind(t: Option<&str>) -> StringMatchKind {
    match t {
        Some("RegularExpression") => StringMatchKind::RegularExpression,
        _ => StringMatchKind::Exact,
    }
}

fn header_modifier(f: &api::HttpHeaderFilter) -> HeaderModifier {
    let pairs = |hs: &Option<Vec<api::HttpHeader>>| {
        hs.iter()
            .flatten()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect::<Vec<_>>()
    };
    HeaderModifier {
        set: pairs(&f.set),
        add: pairs(&f.add),
        remove: f.remove.clone().unwrap_or_default(),
    }
}

fn path_modifier(p: &api::HttpPathModifier) -> Option<PathModifier> {
    match p.r#type.as_str() {
        "ReplaceFullPath" => p.replace_full_path.clone().map(PathModifier::ReplaceFullPath),
        "ReplacePrefixMatch" => p
            .replace_prefix_match
            .clone()
            .map(PathModifier::ReplacePrefixMatch),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::service_backends,
        refgrants::ReferenceGrants,
        tests::{mk_http_route, mk_service, mk_tcp_route},
    };
    use kgateway_translator_core::backend::BackendError;

    struct Fixture {
        services: Arc<StaticCollection<kgateway_translator_k8s_api::Service>>,
        inputs: RouteInputs,
        index: RoutesIndex,
    }

    fn fixture() -> Fixture {
        let services = StaticCollection::for_resource("services").shared();
        let grants = StaticCollection::for_resource("grants").shared();
        let mut backends = BackendIndex::new(Arc::new(ReferenceGrants::new(grants)));
        backends.register(GroupKind::service(), service_backends(services.clone()));
        let inputs = RouteInputs {
            http_routes: StaticCollection::for_resource("http-routes").shared(),
            tcp_routes: StaticCollection::for_resource("tcp-routes").shared(),
            tls_routes: StaticCollection::for_resource("tls-routes").shared(),
        };
        let index = RoutesIndex::new(
            inputs.clone(),
            Arc::new(backends),
            Arc::new(PolicyIndex::new(vec![])),
        );
        Fixture {
            services,
            inputs,
            index,
        }
    }

    fn http(index: &RoutesIndex, ns: &str, name: &str) -> Arc<HttpRouteIr> {
        let key = ObjectSource::new(GroupKind::http_route(), ns, name).resource_name();
        match index.routes().get(&key).as_deref() {
            Some(RouteIr::Http(r)) => r.clone(),
            route => panic!("expected an HTTPRoute, got {route:?}"),
        }
    }

    #[test]
    fn http_routes_resolve_backends_and_delegates() {
        let f = fixture();
        f.services.apply(mk_service("default", "web", &[("http", 80)]));
        f.inputs.http_routes.apply(mk_http_route(
            "default",
            "route",
            &["gw"],
            serde_json::json!([
                {
                    "matches": [{ "path": { "type": "Exact", "value": "/login" } }],
                    "backendRefs": [
                        { "name": "web", "port": 80, "weight": 3 },
                        { "name": "missing", "port": 80 },
                    ],
                },
                {
                    "backendRefs": [
                        { "group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "name": "*", "namespace": "team" },
                    ],
                },
            ]),
        ));

        let route = http(&f.index, "default", "route");
        assert_eq!(route.rules.len(), 2);

        let rule = &route.rules[0];
        assert_eq!(rule.matches, vec![HttpRouteMatch {
            path: PathMatch::Exact("/login".to_string()),
            ..Default::default()
        }]);
        match &rule.backends[..] {
            [HttpBackendOrDelegate::Backend(a), HttpBackendOrDelegate::Backend(b)] => {
                assert_eq!(a.backend.cluster_name, "kube_default_web_80");
                assert_eq!(a.backend.weight, 3);
                assert!(matches!(b.backend.backend, Err(BackendError::NotFound { .. })));
                assert_eq!(b.backend.weight, 1);
            }
            backends => panic!("unexpected backends {backends:?}"),
        }

        let rule = &route.rules[1];
        assert_eq!(rule.matches, vec![HttpRouteMatch::default()]);
        assert_eq!(
            rule.backends,
            vec![HttpBackendOrDelegate::Delegate(DelegateRef::new("team", "*"))]
        );
    }

    #[test]
    fn inline_filters_become_a_builtin_policy() {
        let f = fixture();
        f.inputs.http_routes.apply(mk_http_route(
            "default",
            "route",
            &["gw"],
            serde_json::json!([{
                "filters": [
                    {
                        "type": "RequestHeaderModifier",
                        "requestHeaderModifier": { "set": [{ "name": "x-env", "value": "prod" }], "remove": ["x-debug"] },
                    },
                    {
                        "type": "ExtensionRef",
                        "extensionRef": { "group": "example.com", "kind": "Timeout", "name": "missing" },
                    },
                ],
            }]),
        ));

        let route = http(&f.index, "default", "route");
        let builtins = route.rules[0].extension_refs.get(&builtin_group_kind());
        assert_eq!(builtins.len(), 1);
        let BuiltinFilters(filters) = builtins[0]
            .policy
            .as_any()
            .downcast_ref::<BuiltinFilters>()
            .unwrap();
        assert_eq!(
            filters,
            &vec![HttpRouteFilter::RequestHeaderModifier(HeaderModifier {
                set: vec![("x-env".to_string(), "prod".to_string())],
                add: vec![],
                remove: vec!["x-debug".to_string()],
            })]
        );
        assert!(
            route.rules[0]
                .extension_refs
                .get(&GroupKind::new("example.com", "Timeout"))
                .is_empty(),
            "unknown extension references are skipped"
        );
    }

    #[test]
    fn routes_are_indexed_by_gateway() {
        let f = fixture();
        f.inputs.http_routes.apply(mk_http_route(
            "default",
            "a",
            &["gw", "other/gw2"],
            serde_json::json!([]),
        ));
        f.inputs
            .tcp_routes
            .apply(mk_tcp_route("default", "b", &["gw"], &[("web", 80)]));

        let gw = ObjectSource::new(GroupKind::gateway(), "default", "gw");
        let gw2 = ObjectSource::new(GroupKind::gateway(), "other", "gw2");
        let routes = Derived::from_nothing("routes", {
            let by_gateway = f.index.by_gateway.clone();
            move |ctx| {
                let mut names = Vec::new();
                for gw in [&gw, &gw2] {
                    for r in ctx.fetch_index(&by_gateway, &gw.namespaced_name()) {
                        names.push(format!("{}>{}", gw.name, r.source().name));
                    }
                }
                names.sort();
                Some(Names(names))
            }
        });
        assert_eq!(
            routes.get("").unwrap().0,
            vec!["gw2>a", "gw>a", "gw>b"]
        );

        f.inputs.http_routes.delete("default/a");
        assert_eq!(routes.get("").unwrap().0, vec!["gw>b"]);
    }

    #[derive(Debug, PartialEq)]
    struct Names(Vec<String>);

    impl kgateway_translator_collections::Keyed for Names {
        fn key(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn tcp_backends_are_resolved_in_order() {
        let f = fixture();
        f.services.apply(mk_service("default", "web", &[("tcp", 9000)]));
        f.inputs
            .tcp_routes
            .apply(mk_tcp_route("default", "tcp", &["gw"], &[("web", 9000), ("db", 5432)]));
        let key = ObjectSource::new(GroupKind::tcp_route(), "default", "tcp").resource_name();
        let route = f.index.routes().get(&key).unwrap();
        let RouteIr::Tcp(route) = route.as_ref() else {
            panic!("expected a TCPRoute");
        };
        let clusters = route
            .backends
            .iter()
            .map(|b| b.cluster_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(clusters, vec!["kube_default_web_9000", "blackhole_cluster"]);
    }
}
