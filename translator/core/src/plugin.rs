//! Extension points for policies and backends.
//!
//! A plugin declares the capabilities it has by returning an implementation
//! from the corresponding accessor. The translator asks each plugin for the
//! capability it needs and skips plugins that don't provide it.

use crate::{
    backend::BackendObjectIr,
    listener::ListenerIr,
    policy::{PolicyAtt, PolicyIr},
    route::{HeaderModifier, HttpRouteFilter, HttpRouteMatch, PathModifier, RequestRedirect},
    GroupKind, ObjectSource,
};
use std::{any::Any, collections::BTreeMap, sync::Arc};

/// The translated form of a single route rule match.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteOutput {
    pub name: String,
    pub matcher: HttpRouteMatch,
    pub action: RouteAction,
    pub request_headers: HeaderModifier,
    pub response_headers: HeaderModifier,
    /// Cluster names that receive a copy of requests.
    pub mirrors: Vec<String>,
    pub typed_per_filter_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteAction {
    Forward {
        clusters: Vec<WeightedCluster>,
        host_rewrite: Option<String>,
        path_rewrite: Option<PathModifier>,
    },
    Redirect(RequestRedirect),
    DirectResponse {
        status: u16,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

/// The translated form of a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterOutput {
    pub name: String,
    pub backend: ObjectSource,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("invalid policy {policy}: {reason}")]
    InvalidPolicy { policy: GroupKind, reason: String },
}

/// Can modify a route.
pub trait RoutePlugin: Send + Sync {
    fn apply_for_route(
        &self,
        policy: &PolicyAtt,
        out: &mut RouteOutput,
    ) -> Result<(), PluginError>;
}

/// Can modify a listener.
pub trait ListenerPlugin: Send + Sync {
    fn apply_for_listener(
        &self,
        policy: &PolicyAtt,
        out: &mut ListenerIr,
    ) -> Result<(), PluginError>;
}

/// Can modify a cluster.
pub trait BackendPlugin: Send + Sync {
    fn process_backend(&self, backend: &BackendObjectIr, out: &mut ClusterOutput);
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn route(&self) -> Option<&dyn RoutePlugin> {
        None
    }

    fn listener(&self) -> Option<&dyn ListenerPlugin> {
        None
    }

    fn backend(&self) -> Option<&dyn BackendPlugin> {
        None
    }
}

/// Plugins keyed by the policy or backend kind they own.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    by_kind: BTreeMap<GroupKind, Arc<dyn Plugin>>,
}

/// The kind under which builtin route filters are attached.
pub fn builtin_group_kind() -> GroupKind {
    GroupKind::new("builtin", "builtin")
}

/// Filters declared inline on a route rule.
#[derive(Debug)]
pub struct BuiltinFilters(pub Vec<HttpRouteFilter>);

/// Applies [`BuiltinFilters`] to routes.
#[derive(Debug, Default)]
pub struct BuiltinPlugin(());

// === impl PluginRegistry ===

impl PluginRegistry {
    /// A registry holding only the builtin plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(builtin_group_kind(), Arc::new(BuiltinPlugin::default()));
        registry
    }

    pub fn register(&mut self, gk: GroupKind, plugin: Arc<dyn Plugin>) {
        self.by_kind.insert(gk, plugin);
    }

    pub fn get(&self, gk: &GroupKind) -> Option<&Arc<dyn Plugin>> {
        self.by_kind.get(gk)
    }

    pub fn route_plugin(&self, gk: &GroupKind) -> Option<&dyn RoutePlugin> {
        self.get(gk).and_then(|p| p.route())
    }

    pub fn listener_plugin(&self, gk: &GroupKind) -> Option<&dyn ListenerPlugin> {
        self.get(gk).and_then(|p| p.listener())
    }

    pub fn backend_plugins(&self) -> impl Iterator<Item = &dyn BackendPlugin> {
        self.by_kind.values().filter_map(|p| p.backend())
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.by_kind.iter().map(|(gk, p)| (gk, p.name())))
            .finish()
    }
}

// === impl BuiltinFilters ===

impl PolicyIr for BuiltinFilters {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Builtin filters are derived from the route that carries them, so the
    /// route's own change detection covers them.
    fn policy_eq(&self, _: &dyn PolicyIr) -> bool {
        true
    }
}

// === impl BuiltinPlugin ===

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn route(&self) -> Option<&dyn RoutePlugin> {
        Some(self)
    }
}

impl RoutePlugin for BuiltinPlugin {
    fn apply_for_route(
        &self,
        policy: &PolicyAtt,
        out: &mut RouteOutput,
    ) -> Result<(), PluginError> {
        let filters = match policy.policy.as_any().downcast_ref::<BuiltinFilters>() {
            Some(BuiltinFilters(filters)) => filters,
            None => {
                return Err(PluginError::InvalidPolicy {
                    policy: policy.group_kind.clone(),
                    reason: "not a builtin filter set".to_string(),
                })
            }
        };

        for filter in filters {
            match filter {
                HttpRouteFilter::RequestHeaderModifier(m) => {
                    merge_headers(&mut out.request_headers, m)
                }
                HttpRouteFilter::ResponseHeaderModifier(m) => {
                    merge_headers(&mut out.response_headers, m)
                }
                HttpRouteFilter::RequestRedirect(redirect) => {
                    out.action = RouteAction::Redirect(redirect.clone());
                }
                HttpRouteFilter::UrlRewrite(rewrite) => {
                    if let RouteAction::Forward {
                        host_rewrite,
                        path_rewrite,
                        ..
                    } = &mut out.action
                    {
                        if rewrite.hostname.is_some() {
                            host_rewrite.clone_from(&rewrite.hostname);
                        }
                        if rewrite.path.is_some() {
                            path_rewrite.clone_from(&rewrite.path);
                        }
                    }
                }
                HttpRouteFilter::RequestMirror(backend) => {
                    if backend.is_resolved() {
                        out.mirrors.push(backend.cluster_name.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

fn merge_headers(into: &mut HeaderModifier, from: &HeaderModifier) {
    into.set.extend(from.set.iter().cloned());
    into.add.extend(from.add.iter().cloned());
    into.remove.extend(from.remove.iter().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::UrlRewrite;

    fn forward() -> RouteOutput {
        RouteOutput {
            name: "route".to_string(),
            matcher: HttpRouteMatch::default(),
            action: RouteAction::Forward {
                clusters: vec![WeightedCluster {
                    name: "kube_ns_svc_80".to_string(),
                    weight: 1,
                }],
                host_rewrite: None,
                path_rewrite: None,
            },
            request_headers: HeaderModifier::default(),
            response_headers: HeaderModifier::default(),
            mirrors: vec![],
            typed_per_filter_config: BTreeMap::new(),
        }
    }

    fn builtin(filters: Vec<HttpRouteFilter>) -> PolicyAtt {
        PolicyAtt::new(builtin_group_kind(), Arc::new(BuiltinFilters(filters)))
    }

    #[test]
    fn builtin_filters_are_always_equal() {
        let a = builtin(vec![]);
        let b = builtin(vec![HttpRouteFilter::UrlRewrite(UrlRewrite::default())]);
        assert_eq!(a, b);
    }

    #[test]
    fn builtin_plugin_applies_filters() {
        let registry = PluginRegistry::with_builtins();
        let plugin = registry
            .route_plugin(&builtin_group_kind())
            .expect("builtin plugin must be registered");

        let mut out = forward();
        let policy = builtin(vec![
            HttpRouteFilter::RequestHeaderModifier(HeaderModifier {
                set: vec![("x-env".to_string(), "prod".to_string())],
                ..Default::default()
            }),
            HttpRouteFilter::UrlRewrite(UrlRewrite {
                hostname: Some("internal.example.com".to_string()),
                path: Some(PathModifier::ReplacePrefixMatch("/v2".to_string())),
            }),
        ]);
        plugin.apply_for_route(&policy, &mut out).unwrap();

        assert_eq!(
            out.request_headers.set,
            vec![("x-env".to_string(), "prod".to_string())]
        );
        match out.action {
            RouteAction::Forward {
                host_rewrite,
                path_rewrite,
                ..
            } => {
                assert_eq!(host_rewrite.as_deref(), Some("internal.example.com"));
                assert_eq!(
                    path_rewrite,
                    Some(PathModifier::ReplacePrefixMatch("/v2".to_string()))
                );
            }
            action => panic!("unexpected action {action:?}"),
        }
    }

    #[test]
    fn redirect_replaces_the_action() {
        let plugin = BuiltinPlugin::default();
        let mut out = forward();
        let redirect = RequestRedirect {
            scheme: Some("https".to_string()),
            status_code: Some(301),
            ..Default::default()
        };
        plugin
            .apply_for_route(
                &builtin(vec![HttpRouteFilter::RequestRedirect(redirect.clone())]),
                &mut out,
            )
            .unwrap();
        assert_eq!(out.action, RouteAction::Redirect(redirect));
    }
}
