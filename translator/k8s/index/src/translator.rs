//! Translates each Gateway managed by this controller into a configuration
//! snapshot: listeners, route configurations, clusters, and status reports.

use crate::{
    delegation::route_parent_ref,
    listeners::translate_listeners,
    metrics::IndexMetrics,
    policies::PolicyIndex,
    query::{GatewayQueries, RouteError, RoutesForGwResult},
};
use kgateway_translator_collections::{Derived, HandlerContext, Keyed, StaticCollection};
use kgateway_translator_core::{
    backend::{BackendError, BackendObjectIr, BackendRefIr},
    gateway::{
        AllowedRoutes, FromNamespaces, GatewayIr, Listener, ListenerTls, Protocol, SecretRef,
        TlsMode,
    },
    listener::ListenerIr,
    plugin::{
        builtin_group_kind, BuiltinFilters, ClusterOutput, PluginRegistry, RouteAction,
        RouteOutput, WeightedCluster,
    },
    policy::AttachedPolicies,
    report::{condition, reason, ConditionReport, ReportMap},
    route::{HeaderModifier, HttpRouteFilter, HttpRouteRuleMatchIr, ParentRef, RouteIr},
    GroupKind, ObjectSource, GATEWAY_GROUP,
};
use kgateway_translator_k8s_api::{gateway_api as api, ResourceExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Everything derived from one Gateway.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewaySnapshot {
    pub gateway: ObjectSource,
    pub listeners: Vec<ListenerIr>,
    pub route_configs: Vec<RouteConfigOutput>,
    /// Clusters for every resolved backend, sorted by name.
    pub clusters: Vec<ClusterOutput>,
    pub reports: ReportMap,
}

/// The routes of one HTTP filter chain.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteConfigOutput {
    /// `<listener>~<chain>`.
    pub name: String,
    pub virtual_hosts: Vec<VirtualHostOutput>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VirtualHostOutput {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteOutput>,
}

pub struct GatewayTranslator {
    controller_name: String,
    classes: Arc<StaticCollection<api::GatewayClass>>,
    policies: Arc<PolicyIndex>,
    queries: Arc<GatewayQueries>,
    plugins: PluginRegistry,
    metrics: Option<IndexMetrics>,
}

/// Rules without backends, or whose policies failed to apply, respond with
/// this status.
const INVALID_ROUTE_STATUS: u16 = 500;

impl Keyed for GatewaySnapshot {
    fn key(&self) -> String {
        self.gateway.namespaced_name()
    }
}

// === impl GatewayTranslator ===

impl GatewayTranslator {
    pub fn new(
        controller_name: impl Into<String>,
        classes: Arc<StaticCollection<api::GatewayClass>>,
        policies: Arc<PolicyIndex>,
        queries: Arc<GatewayQueries>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            controller_name: controller_name.into(),
            classes,
            policies,
            queries,
            plugins,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IndexMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A collection of snapshots, one per managed Gateway.
    pub fn snapshots(
        self: Arc<Self>,
        gateways: Arc<StaticCollection<api::Gateway>>,
    ) -> Arc<Derived<api::Gateway, GatewaySnapshot>> {
        Derived::map("gateway-snapshots", gateways, move |ctx, gw: &api::Gateway| {
            self.translate(ctx, gw)
        })
    }

    /// Returns `None` for Gateways of classes owned by other controllers.
    pub fn translate(
        &self,
        ctx: &mut HandlerContext<'_>,
        gw: &api::Gateway,
    ) -> Option<GatewaySnapshot> {
        let class_name = &gw.spec.gateway_class_name;
        let class = ctx.fetch_one(self.classes.as_ref(), class_name)?;
        if class.spec.controller_name != self.controller_name {
            return None;
        }

        let mut reports = ReportMap::default();
        let ir = self.gateway_ir(ctx, gw, &mut reports);
        let _span = tracing::debug_span!("translate", gateway = %ir.source).entered();
        reports.gateway(&ir.source).observed_generation = gw.metadata.generation;

        let routes = self.queries.routes_for_gateway(ctx, &ir, &mut reports);
        report_routes(&routes, &mut reports);

        let mut listeners =
            translate_listeners(ctx, &self.queries, &ir, &routes, &mut reports);
        let mut policy_errors = Vec::new();
        for l in &mut listeners {
            policy_errors.extend(self.apply_listener_plugins(l));
        }

        let mut route_configs = Vec::new();
        for l in &listeners {
            for chain in &l.http_filter_chains {
                let mut virtual_hosts = Vec::with_capacity(chain.vhosts.len());
                for vh in &chain.vhosts {
                    let mut parents = chain.attached_policies.clone();
                    parents.append(&vh.attached_policies);
                    let routes = vh
                        .rules
                        .iter()
                        .map(|rule| self.route_output(rule, &parents, &mut reports))
                        .collect();
                    virtual_hosts.push(VirtualHostOutput {
                        name: vh.name.clone(),
                        domains: vec![vh.hostname.clone()],
                        routes,
                    });
                }
                route_configs.push(RouteConfigOutput {
                    name: format!("{}~{}", l.name, chain.common.name),
                    virtual_hosts,
                });
            }
        }

        let clusters = self.clusters(&listeners);

        let gw_report = reports.gateway(&ir.source);
        if policy_errors.is_empty() {
            gw_report.set_condition(ConditionReport::new(
                condition::ACCEPTED,
                true,
                reason::ACCEPTED,
                "",
            ));
        } else {
            gw_report.set_condition(ConditionReport::new(
                condition::ACCEPTED,
                false,
                reason::INVALID,
                policy_errors.join("; "),
            ));
        }
        if listeners.is_empty() && !ir.listeners.is_empty() {
            gw_report.set_condition(ConditionReport::new(
                condition::PROGRAMMED,
                false,
                reason::INVALID,
                "no listener could be programmed",
            ));
        } else {
            gw_report.set_condition(ConditionReport::new(
                condition::PROGRAMMED,
                true,
                reason::PROGRAMMED,
                "",
            ));
        }

        tracing::debug!(
            listeners = listeners.len(),
            clusters = clusters.len(),
            "Translated gateway"
        );
        if let Some(m) = &self.metrics {
            m.translated(
                &ir.source.namespace,
                &ir.source.name,
                listeners.len(),
                route_configs.len(),
                clusters.len(),
            );
        }
        Some(GatewaySnapshot {
            gateway: ir.source,
            listeners,
            route_configs,
            clusters,
            reports,
        })
    }

    /// Builds the listener-level model of a Gateway. Listeners with ports
    /// that can't be bound are reported and left out.
    pub fn gateway_ir(
        &self,
        ctx: &mut HandlerContext<'_>,
        gw: &api::Gateway,
        reports: &mut ReportMap,
    ) -> GatewayIr {
        let source = ObjectSource::new(
            GroupKind::gateway(),
            gw.namespace().unwrap_or_default(),
            gw.name_unchecked(),
        );

        let mut attached_policies = AttachedPolicies::default();
        let mut attached_http_policies = AttachedPolicies::default();
        for att in self.policies.policies_for(ctx, &source, None).iter() {
            if self.plugins.listener_plugin(&att.group_kind).is_some() {
                attached_policies.push(att.clone());
            } else {
                attached_http_policies.push(att.clone());
            }
        }

        let listeners = gw
            .spec
            .listeners
            .iter()
            .filter_map(|l| {
                let Ok(port) = u16::try_from(l.port) else {
                    reports
                        .gateway(&source)
                        .listener(&l.name)
                        .set_condition(ConditionReport::new(
                            condition::ACCEPTED,
                            false,
                            reason::UNSUPPORTED_VALUE,
                            format!("invalid port {}", l.port),
                        ));
                    return None;
                };
                Some(Listener {
                    name: l.name.clone(),
                    protocol: Protocol::from(l.protocol.as_str()),
                    port,
                    hostname: l.hostname.clone().filter(|h| !h.is_empty()),
                    tls: l.tls.as_ref().map(listener_tls),
                    allowed_routes: l.allowed_routes.as_ref().map(allowed_routes),
                    attached_policies: self.policies.policies_for(ctx, &source, Some(&l.name)),
                    parent: source.clone(),
                })
            })
            .collect();

        GatewayIr {
            source,
            gateway_class_name: gw.spec.gateway_class_name.clone(),
            listeners,
            attached_policies,
            attached_http_policies,
        }
    }

    /// Returns the errors of the policies that could not be applied.
    fn apply_listener_plugins(&self, l: &mut ListenerIr) -> Vec<String> {
        let policies = l.attached_policies.clone();
        let mut errors = Vec::new();
        for att in policies.iter() {
            let Some(plugin) = self.plugins.listener_plugin(&att.group_kind) else {
                continue;
            };
            if let Err(error) = plugin.apply_for_listener(att, l) {
                tracing::warn!(listener = %l.name, %error, "Failed to apply listener policy");
                errors.push(error.to_string());
            }
        }
        errors
    }

    /// Applies policies from the least to the most specific attachment point,
    /// so that more specific policies win.
    fn route_output(
        &self,
        rule: &HttpRouteRuleMatchIr,
        parents: &AttachedPolicies,
        reports: &mut ReportMap,
    ) -> RouteOutput {
        let mut out = RouteOutput {
            name: rule.name.clone(),
            matcher: rule.matcher.clone(),
            action: forward(rule),
            request_headers: HeaderModifier::default(),
            response_headers: HeaderModifier::default(),
            mirrors: vec![],
            typed_per_filter_config: BTreeMap::new(),
        };

        let layers = [
            parents,
            &rule.parent.attached_policies,
            &rule.attached_policies,
            &rule.extension_refs,
        ];
        let mut errors = Vec::new();
        for att in layers.into_iter().flat_map(AttachedPolicies::iter) {
            if !att.errors.is_empty() {
                errors.extend(att.errors.iter().cloned());
                continue;
            }
            let Some(plugin) = self.plugins.route_plugin(&att.group_kind) else {
                continue;
            };
            if let Err(error) = plugin.apply_for_route(att, &mut out) {
                errors.push(error.to_string());
            }
        }

        if !errors.is_empty() {
            tracing::info!(route = %rule.name, ?errors, "Route policies could not be applied");
            out.action = RouteAction::DirectResponse {
                status: INVALID_ROUTE_STATUS,
            };
            let (route, parent_ref) = reported_ref(rule);
            reports
                .parent_ref(&route, &parent_ref)
                .set_condition(ConditionReport::new(
                    condition::PARTIALLY_INVALID,
                    true,
                    reason::UNSUPPORTED_VALUE,
                    errors.join("; "),
                ));
        }
        out
    }

    fn clusters(&self, listeners: &[ListenerIr]) -> Vec<ClusterOutput> {
        let mut backends = BTreeMap::<String, Arc<BackendObjectIr>>::new();
        let mut add = |b: &BackendRefIr| {
            if let Ok(backend) = &b.backend {
                backends
                    .entry(b.cluster_name.clone())
                    .or_insert_with(|| backend.clone());
            }
        };
        for l in listeners {
            for chain in &l.http_filter_chains {
                for rule in chain.vhosts.iter().flat_map(|vh| &vh.rules) {
                    rule.backends.iter().for_each(|b| add(&b.backend));
                    mirrors(&rule.extension_refs).for_each(&mut add);
                }
            }
            for chain in &l.tcp_filter_chains {
                chain.backends.iter().for_each(&mut add);
            }
        }

        backends
            .into_iter()
            .map(|(name, backend)| {
                let mut out = ClusterOutput {
                    name,
                    backend: backend.source.clone(),
                    port: backend.port,
                    metadata: BTreeMap::new(),
                };
                for plugin in self.plugins.backend_plugins() {
                    plugin.process_backend(&backend, &mut out);
                }
                out
            })
            .collect()
    }
}

fn forward(rule: &HttpRouteRuleMatchIr) -> RouteAction {
    if rule.backends.is_empty() {
        return RouteAction::DirectResponse {
            status: INVALID_ROUTE_STATUS,
        };
    }
    RouteAction::Forward {
        clusters: rule
            .backends
            .iter()
            .map(|b| WeightedCluster {
                name: b.backend.cluster_name.clone(),
                weight: b.backend.weight,
            })
            .collect(),
        host_rewrite: None,
        path_rewrite: None,
    }
}

fn mirrors(policies: &AttachedPolicies) -> impl Iterator<Item = &BackendRefIr> {
    policies
        .get(&builtin_group_kind())
        .iter()
        .filter_map(|att| att.policy.as_any().downcast_ref::<BuiltinFilters>())
        .flat_map(|BuiltinFilters(filters)| filters)
        .filter_map(|f| match f {
            HttpRouteFilter::RequestMirror(b) => Some(b),
            _ => None,
        })
}

/// The route and parent reference that a rule's conditions belong to. Rules
/// of delegated children are reported on the child's reference to its
/// parent route.
fn reported_ref(rule: &HttpRouteRuleMatchIr) -> (ObjectSource, ParentRef) {
    match rule.delegation_chain.as_slice() {
        [.., parent, _] => (rule.parent.source.clone(), route_parent_ref(parent)),
        _ => (rule.parent.source.clone(), rule.parent_ref.clone()),
    }
}

/// Records admission results and backend resolution failures on the parent
/// references of each route.
fn report_routes(routes: &RoutesForGwResult, reports: &mut ReportMap) {
    for (route, parent_ref, error) in &routes.route_errors {
        let reason = match error {
            RouteError::NoMatchingParent => reason::NO_MATCHING_PARENT,
            RouteError::NotAllowedByListeners => reason::NOT_ALLOWED_BY_LISTENERS,
            RouteError::NoMatchingListenerHostname => reason::NO_MATCHING_LISTENER_HOSTNAME,
        };
        reports
            .parent_ref(route, parent_ref)
            .set_condition(ConditionReport::new(
                condition::ACCEPTED,
                false,
                reason,
                error.to_string(),
            ));
    }

    let mut seen = BTreeSet::new();
    for info in routes.listener_results.values().flat_map(|r| &r.routes) {
        let route = info.object.source();
        if !seen.insert((route.clone(), info.parent_ref.clone())) {
            continue;
        }
        reports.route(route).observed_generation = info.object.generation();
        reports.parent_ref(route, &info.parent_ref);

        match info.object.as_ref() {
            RouteIr::Http(_) => {
                for rule in &info.rules {
                    let (route, parent_ref) = reported_ref(rule);
                    if route != *info.object.source() {
                        reports.route(&route).observed_generation = rule.parent.generation;
                    }
                    let failed = rule
                        .backends
                        .iter()
                        .map(|b| &b.backend)
                        .chain(mirrors(&rule.extension_refs));
                    for b in failed {
                        report_backend(reports, &route, &parent_ref, b);
                    }
                }
            }
            RouteIr::Tcp(tcp) => {
                for b in &tcp.backends {
                    report_backend(reports, route, &info.parent_ref, b);
                }
            }
            RouteIr::Tls(tls) => {
                for b in &tls.backends {
                    report_backend(reports, route, &info.parent_ref, b);
                }
            }
        }
    }
}

fn report_backend(reports: &mut ReportMap, route: &ObjectSource, parent: &ParentRef, b: &BackendRefIr) {
    let Err(error) = &b.backend else {
        return;
    };
    let reason = match error {
        BackendError::MissingReferenceGrant(_) => reason::REF_NOT_PERMITTED,
        BackendError::UnknownBackendKind(_) => reason::INVALID_KIND,
        BackendError::NotFound { .. } => reason::BACKEND_NOT_FOUND,
        BackendError::MissingPort(_) => reason::UNSUPPORTED_VALUE,
    };
    reports
        .parent_ref(route, parent)
        .set_condition(ConditionReport::new(
            condition::RESOLVED_REFS,
            false,
            reason,
            error.to_string(),
        ));
}

fn listener_tls(tls: &api::GatewayTlsConfig) -> ListenerTls {
    ListenerTls {
        mode: match tls.mode.as_deref() {
            Some("Passthrough") => TlsMode::Passthrough,
            _ => TlsMode::Terminate,
        },
        certificate_refs: tls
            .certificate_refs
            .iter()
            .flatten()
            .map(|r| SecretRef {
                group: r.group.clone(),
                kind: r.kind.clone(),
                namespace: r.namespace.clone(),
                name: r.name.clone(),
            })
            .collect(),
        options: tls
            .options
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn allowed_routes(ar: &api::AllowedRoutes) -> AllowedRoutes {
    let namespaces = match ar.namespaces.as_ref() {
        Some(ns) => match ns.from.as_deref() {
            Some("All") => FromNamespaces::All,
            Some("Selector") => FromNamespaces::Selector(ns.selector.clone()),
            _ => FromNamespaces::Same,
        },
        None => FromNamespaces::Same,
    };
    AllowedRoutes {
        namespaces,
        kinds: ar
            .kinds
            .iter()
            .flatten()
            .map(|k| GroupKind::new(k.group.as_deref().unwrap_or(GATEWAY_GROUP), k.kind.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policies::{PolicyTargetRef, PolicyWrapper},
        refgrants::ReferenceGrants,
        routes::{RouteInputs, RoutesIndex},
        backends::{service_backends, BackendIndex},
        tests::{
            mk_gateway, mk_gateway_class, mk_http_route, mk_refgrant, mk_service, mk_tcp_route,
        },
    };
    use kgateway_translator_collections::Collection;
    use kgateway_translator_core::{
        plugin::{ListenerPlugin, Plugin, PluginError},
        policy::{PolicyAtt, PolicyIr},
        GATEWAY_CONTROLLER_NAME,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::any::Any;

    #[derive(Debug)]
    struct ConnectionLimit(u32);

    impl PolicyIr for ConnectionLimit {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn policy_eq(&self, other: &dyn PolicyIr) -> bool {
            other
                .as_any()
                .downcast_ref::<Self>()
                .is_some_and(|o| o.0 == self.0)
        }
    }

    struct ConnectionLimitPlugin;

    impl Plugin for ConnectionLimitPlugin {
        fn name(&self) -> &str {
            "connection-limit"
        }

        fn listener(&self) -> Option<&dyn ListenerPlugin> {
            Some(self)
        }
    }

    impl ListenerPlugin for ConnectionLimitPlugin {
        fn apply_for_listener(
            &self,
            policy: &PolicyAtt,
            out: &mut ListenerIr,
        ) -> Result<(), PluginError> {
            let limit = policy
                .policy
                .as_any()
                .downcast_ref::<ConnectionLimit>()
                .ok_or_else(|| PluginError::InvalidPolicy {
                    policy: policy.group_kind.clone(),
                    reason: "not a connection limit".to_string(),
                })?;
            out.name = format!("{}@{}", out.name, limit.0);
            Ok(())
        }
    }

    fn limit_kind() -> GroupKind {
        GroupKind::new("example.com", "ConnectionLimit")
    }

    struct Fixture {
        classes: Arc<StaticCollection<api::GatewayClass>>,
        gateways: Arc<StaticCollection<api::Gateway>>,
        services: Arc<StaticCollection<kgateway_translator_k8s_api::Service>>,
        grants: Arc<StaticCollection<api::ReferenceGrant>>,
        policies: Arc<StaticCollection<PolicyWrapper>>,
        routes: RouteInputs,
        snapshots: Arc<Derived<api::Gateway, GatewaySnapshot>>,
        metrics: IndexMetrics,
    }

    fn mk_fixture() -> Fixture {
        crate::tests::init_tracing();
        let classes = StaticCollection::for_resource("classes").shared();
        let gateways = StaticCollection::for_resource("gateways").shared();
        let services = StaticCollection::for_resource("services").shared();
        let grants = StaticCollection::for_resource("grants").shared();
        let policy_objects = StaticCollection::keyed("connection-limits").shared();

        let refgrants = Arc::new(ReferenceGrants::new(grants.clone()));
        let mut backends = BackendIndex::new(refgrants.clone());
        backends.register(GroupKind::service(), service_backends(services.clone()));
        let policy_sources: Vec<Arc<dyn Collection<PolicyWrapper>>> = vec![policy_objects.clone()];
        let policies = Arc::new(PolicyIndex::new(policy_sources));
        let routes = RouteInputs {
            http_routes: StaticCollection::for_resource("http-routes").shared(),
            tcp_routes: StaticCollection::for_resource("tcp-routes").shared(),
            tls_routes: StaticCollection::for_resource("tls-routes").shared(),
        };
        let index = Arc::new(RoutesIndex::new(
            routes.clone(),
            Arc::new(backends),
            policies.clone(),
        ));
        let queries = Arc::new(GatewayQueries::new(
            index,
            StaticCollection::for_resource("namespaces").shared(),
            StaticCollection::for_resource("secrets").shared(),
            refgrants,
        ));

        let mut plugins = PluginRegistry::with_builtins();
        plugins.register(limit_kind(), Arc::new(ConnectionLimitPlugin));
        let metrics = IndexMetrics::register(&mut Default::default());
        let translator = Arc::new(
            GatewayTranslator::new(
                GATEWAY_CONTROLLER_NAME,
                classes.clone(),
                policies,
                queries,
                plugins,
            )
            .with_metrics(metrics.clone()),
        );
        let snapshots = translator.snapshots(gateways.clone());

        classes.apply(mk_gateway_class("kgateway", GATEWAY_CONTROLLER_NAME));
        classes.apply(mk_gateway_class("other", "example.com/other"));
        Fixture {
            classes,
            gateways,
            services,
            grants,
            policies: policy_objects,
            routes,
            snapshots,
            metrics,
        }
    }

    fn http_gateway(class: &str) -> api::Gateway {
        mk_gateway(
            "default",
            "gw",
            class,
            json!([{ "name": "http", "port": 80, "protocol": "HTTP" }]),
        )
    }

    fn gw_source() -> ObjectSource {
        ObjectSource::new(GroupKind::gateway(), "default", "gw")
    }

    #[test]
    fn only_gateways_of_this_controller_are_translated() {
        let f = mk_fixture();
        f.gateways.apply(http_gateway("other"));
        assert!(f.snapshots.get("default/gw").is_none());
        assert_eq!(f.metrics.translations("default", "gw"), 0);

        f.gateways.apply(http_gateway("kgateway"));
        let snapshot = f.snapshots.get("default/gw").expect("gateway must be translated");
        assert!(f.metrics.translations("default", "gw") >= 1);
        let report = &snapshot.reports.gateways[&gw_source()];
        assert_eq!(report.observed_generation, Some(1));
        assert!(report.condition(condition::ACCEPTED).unwrap().status);

        f.classes.delete("kgateway");
        assert!(f.snapshots.get("default/gw").is_none());
    }

    #[test]
    fn routes_become_route_configs_and_clusters() {
        let f = mk_fixture();
        f.services.apply(mk_service("default", "web", &[("http", 8080)]));
        f.routes.http_routes.apply(mk_http_route(
            "default",
            "web",
            &["gw"],
            json!([{
                "backendRefs": [
                    { "name": "web", "port": 8080, "weight": 3 },
                    { "name": "missing", "port": 8080 },
                ],
            }]),
        ));
        f.gateways.apply(http_gateway("kgateway"));

        let snapshot = f.snapshots.get("default/gw").unwrap();
        assert_eq!(snapshot.listeners.len(), 1);
        assert_eq!(snapshot.listeners[0].bind_port, 8080);

        assert_eq!(snapshot.route_configs.len(), 1);
        let config = &snapshot.route_configs[0];
        assert_eq!(config.name, "http~http");
        let vh = &config.virtual_hosts[0];
        assert_eq!(vh.domains, vec!["*"]);
        assert_eq!(
            vh.routes[0].action,
            RouteAction::Forward {
                clusters: vec![
                    WeightedCluster {
                        name: "kube_default_web_8080".to_string(),
                        weight: 3,
                    },
                    WeightedCluster {
                        name: "blackhole_cluster".to_string(),
                        weight: 1,
                    },
                ],
                host_rewrite: None,
                path_rewrite: None,
            }
        );

        let clusters = snapshot
            .clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(clusters, vec!["kube_default_web_8080"]);

        let route = ObjectSource::new(GroupKind::http_route(), "default", "web");
        let parent = &snapshot.reports.routes[&route].parents[0];
        assert_eq!(parent.0.name, "gw");
        assert_eq!(
            parent.1.condition(condition::RESOLVED_REFS).unwrap().reason,
            reason::BACKEND_NOT_FOUND
        );
    }

    #[test]
    fn cross_namespace_backends_are_reported_until_granted() {
        let f = mk_fixture();
        f.services.apply(mk_service("backends", "db", &[("tcp", 5432)]));
        f.routes.tcp_routes.apply(mk_tcp_route(
            "default",
            "db",
            &["gw"],
            &[("db", 5432)],
        ));
        let mut tcp_route = f.routes.tcp_routes.get("default/db").unwrap().as_ref().clone();
        tcp_route.spec.rules[0].backend_refs[0].inner.namespace = Some("backends".to_string());
        f.routes.tcp_routes.apply(tcp_route);
        f.gateways.apply(mk_gateway(
            "default",
            "gw",
            "kgateway",
            json!([{ "name": "db", "port": 5432, "protocol": "TCP" }]),
        ));

        let route = ObjectSource::new(GroupKind::tcp_route(), "default", "db");
        let snapshot = f.snapshots.get("default/gw").unwrap();
        let pr = snapshot.reports.routes[&route].parents[0].1.clone();
        assert_eq!(
            pr.condition(condition::RESOLVED_REFS).unwrap().reason,
            reason::REF_NOT_PERMITTED
        );
        assert!(snapshot.clusters.is_empty());

        f.grants.apply(mk_refgrant(
            "backends",
            "allow-default",
            ("gateway.networking.k8s.io", "TCPRoute", "default"),
            ("", "Service", Some("db")),
        ));
        let snapshot = f.snapshots.get("default/gw").unwrap();
        let pr = &snapshot.reports.routes[&route].parents[0].1;
        assert_eq!(pr.condition(condition::RESOLVED_REFS), None);
        assert_eq!(snapshot.clusters[0].name, "kube_backends_db_5432");
        assert_eq!(snapshot.listeners[0].tcp_filter_chains[0].common.name, "default.db-rule-0");
    }

    #[test]
    fn unadmitted_routes_are_reported_on_their_parent_ref() {
        let f = mk_fixture();
        f.routes.http_routes.apply(mk_http_route(
            "default",
            "web",
            &["gw"],
            json!([{ "backendRefs": [] }]),
        ));
        let mut route = f.routes.http_routes.get("default/web").unwrap().as_ref().clone();
        if let Some(parents) = route.spec.parent_refs.as_mut() {
            parents[0].section_name = Some("https".to_string());
        }
        f.routes.http_routes.apply(route);
        f.gateways.apply(http_gateway("kgateway"));

        let snapshot = f.snapshots.get("default/gw").unwrap();
        let src = ObjectSource::new(GroupKind::http_route(), "default", "web");
        let accepted = snapshot.reports.routes[&src].parents[0]
            .1
            .condition(condition::ACCEPTED)
            .cloned()
            .unwrap();
        assert!(!accepted.status);
        assert_eq!(accepted.reason, reason::NO_MATCHING_PARENT);
        assert!(snapshot.route_configs[0].virtual_hosts.is_empty());
    }

    #[test]
    fn gateway_policies_reach_listener_plugins() {
        let f = mk_fixture();
        f.policies.apply(PolicyWrapper {
            source: ObjectSource::new(limit_kind(), "default", "limit"),
            creation: None,
            target_refs: vec![PolicyTargetRef {
                group: GATEWAY_GROUP.to_string(),
                kind: "Gateway".to_string(),
                name: "gw".to_string(),
                section_name: None,
            }],
            policy: Arc::new(ConnectionLimit(100)),
            errors: vec![],
        });
        f.routes.tcp_routes.apply(mk_tcp_route("default", "db", &["gw"], &[]));
        f.gateways.apply(mk_gateway(
            "default",
            "gw",
            "kgateway",
            json!([{ "name": "db", "port": 5432, "protocol": "TCP" }]),
        ));

        let snapshot = f.snapshots.get("default/gw").unwrap();
        assert_eq!(snapshot.listeners[0].name, "db@100");
    }

    #[derive(Debug)]
    struct Unlimited;

    impl PolicyIr for Unlimited {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn policy_eq(&self, other: &dyn PolicyIr) -> bool {
            other.as_any().is::<Self>()
        }
    }

    #[test]
    fn rejected_listener_policies_are_reported_on_the_gateway() {
        let f = mk_fixture();
        f.policies.apply(PolicyWrapper {
            source: ObjectSource::new(limit_kind(), "default", "limit"),
            creation: None,
            target_refs: vec![PolicyTargetRef {
                group: GATEWAY_GROUP.to_string(),
                kind: "Gateway".to_string(),
                name: "gw".to_string(),
                section_name: None,
            }],
            policy: Arc::new(Unlimited),
            errors: vec![],
        });
        f.routes.tcp_routes.apply(mk_tcp_route("default", "db", &["gw"], &[]));
        f.gateways.apply(mk_gateway(
            "default",
            "gw",
            "kgateway",
            json!([{ "name": "db", "port": 5432, "protocol": "TCP" }]),
        ));

        let snapshot = f.snapshots.get("default/gw").unwrap();
        assert_eq!(snapshot.listeners[0].name, "db");
        let report = &snapshot.reports.gateways[&gw_source()];
        let accepted = report.condition(condition::ACCEPTED).unwrap();
        assert!(!accepted.status);
        assert_eq!(accepted.reason, reason::INVALID);
        assert!(
            accepted.message.contains("not a connection limit"),
            "{}",
            accepted.message
        );
        assert!(report.condition(condition::PROGRAMMED).unwrap().status);

        // Replacing the policy with a valid one accepts the gateway again.
        f.policies.apply(PolicyWrapper {
            source: ObjectSource::new(limit_kind(), "default", "limit"),
            creation: None,
            target_refs: vec![PolicyTargetRef {
                group: GATEWAY_GROUP.to_string(),
                kind: "Gateway".to_string(),
                name: "gw".to_string(),
                section_name: None,
            }],
            policy: Arc::new(ConnectionLimit(10)),
            errors: vec![],
        });
        let snapshot = f.snapshots.get("default/gw").unwrap();
        assert_eq!(snapshot.listeners[0].name, "db@10");
        let report = &snapshot.reports.gateways[&gw_source()];
        assert!(report.condition(condition::ACCEPTED).unwrap().status);
    }

    #[test]
    fn redirects_need_no_backends() {
        let f = mk_fixture();
        f.routes.http_routes.apply(mk_http_route(
            "default",
            "redirect",
            &["gw"],
            json!([
                {
                    "matches": [{ "path": { "type": "Exact", "value": "/old" } }],
                    "filters": [{
                        "type": "RequestRedirect",
                        "requestRedirect": { "scheme": "https", "statusCode": 301 },
                    }],
                },
                { "matches": [{ "path": { "type": "PathPrefix", "value": "/" } }] },
            ]),
        ));
        f.gateways.apply(http_gateway("kgateway"));

        let snapshot = f.snapshots.get("default/gw").unwrap();
        let routes = &snapshot.route_configs[0].virtual_hosts[0].routes;
        assert_eq!(routes.len(), 2);
        assert!(matches!(routes[0].action, RouteAction::Redirect(_)));
        assert_eq!(
            routes[1].action,
            RouteAction::DirectResponse {
                status: INVALID_ROUTE_STATUS
            }
        );
    }

    #[test]
    fn retranslation_is_stable() {
        let f = mk_fixture();
        f.services.apply(mk_service("default", "web", &[("http", 8080)]));
        f.routes.http_routes.apply(mk_http_route(
            "default",
            "web",
            &["gw"],
            json!([{ "backendRefs": [{ "name": "web", "port": 8080 }] }]),
        ));
        f.gateways.apply(http_gateway("kgateway"));
        let before = f.snapshots.get("default/gw").unwrap();

        f.services.apply(mk_service("default", "unrelated", &[("http", 80)]));
        f.gateways.apply(http_gateway("kgateway"));
        let after = f.snapshots.get("default/gw").unwrap();
        assert!(Arc::ptr_eq(&before, &after), "unchanged output must not be republished");
    }
}
