//! Flattens HTTPRoute delegation into the rule matches of the routes that
//! actually carry backends.
//!
//! A rule may name child HTTPRoutes instead of backends. Each child rule
//! match is kept only when the parent's match is a prefix of it, and children
//! inherit the hostnames of the route that delegated to them. Errors are
//! scoped to the delegation edge that caused them.

use crate::routes::RoutesIndex;
use kgateway_translator_collections::HandlerContext;
use kgateway_translator_core::{
    report::{condition, reason, ConditionReport, ReportMap},
    route::{
        DelegateRef, HttpBackend, HttpBackendOrDelegate, HttpRouteIr, HttpRouteMatch,
        HttpRouteRuleMatchIr, ParentRef, PathMatch,
    },
    GroupKind, ObjectSource, GATEWAY_GROUP,
};
use std::{collections::HashSet, sync::Arc};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    #[error("delegation cycle through {0}")]
    CyclicReference(ObjectSource),

    #[error("no child routes match {0}")]
    UnresolvedReference(DelegateRef),

    #[error("child route {0} not found")]
    NotFound(DelegateRef),

    #[error("child route {0} must not declare hostnames")]
    ChildHostnames(ObjectSource),
}

struct Flattener<'a, 'c> {
    ctx: &'a mut HandlerContext<'c>,
    routes: &'a RoutesIndex,
    reports: &'a mut ReportMap,
    /// The parent reference through which the root reached the gateway.
    gateway_ref: &'a ParentRef,
    visited: HashSet<ObjectSource>,
    chain: Vec<ObjectSource>,
    out: Vec<HttpRouteRuleMatchIr>,
}

/// Returns every rule match reachable from `root`, in rule order, with
/// delegated matches expanded depth first.
pub fn flatten_route(
    ctx: &mut HandlerContext<'_>,
    routes: &RoutesIndex,
    root: &Arc<HttpRouteIr>,
    gateway_ref: &ParentRef,
    reports: &mut ReportMap,
) -> Vec<HttpRouteRuleMatchIr> {
    let mut f = Flattener {
        ctx,
        routes,
        reports,
        gateway_ref,
        visited: HashSet::from([root.source.clone()]),
        chain: vec![root.source.clone()],
        out: Vec::new(),
    };
    f.flatten(root, gateway_ref, None);
    f.out
}

/// The parent reference a child route uses to name `parent`.
pub fn route_parent_ref(parent: &ObjectSource) -> ParentRef {
    ParentRef {
        group: Some(GATEWAY_GROUP.to_string()),
        kind: Some("HTTPRoute".to_string()),
        namespace: Some(parent.namespace.clone()),
        name: parent.name.clone(),
        section_name: None,
        port: None,
    }
}

// === impl Flattener ===

impl Flattener<'_, '_> {
    fn flatten(
        &mut self,
        route: &Arc<HttpRouteIr>,
        reached_by: &ParentRef,
        parent_match: Option<&HttpRouteMatch>,
    ) {
        for (rule_index, rule) in route.rules.iter().enumerate() {
            let backends = rule
                .backends
                .iter()
                .filter_map(|b| match b {
                    HttpBackendOrDelegate::Backend(b) => Some(b.clone()),
                    HttpBackendOrDelegate::Delegate(_) => None,
                })
                .collect::<Vec<HttpBackend>>();
            let delegates = rule
                .backends
                .iter()
                .filter_map(|b| match b {
                    HttpBackendOrDelegate::Delegate(d) => Some(d),
                    HttpBackendOrDelegate::Backend(_) => None,
                })
                .collect::<Vec<_>>();

            for (match_index, matcher) in rule.matches.iter().enumerate() {
                if let Some(parent) = parent_match {
                    if !is_delegated_route_match(parent, matcher) {
                        continue;
                    }
                }

                if delegates.is_empty() || !backends.is_empty() {
                    self.out.push(HttpRouteRuleMatchIr {
                        name: rule_match_name(&route.source, rule_index, match_index),
                        parent: route.clone(),
                        parent_ref: self.gateway_ref.clone(),
                        delegation_chain: self.chain.clone(),
                        rule_index,
                        match_index,
                        matcher: matcher.clone(),
                        backends: backends.clone(),
                        extension_refs: rule.extension_refs.clone(),
                        attached_policies: rule.attached_policies.clone(),
                    });
                }

                for delegate in &delegates {
                    self.delegate(route, reached_by, matcher, delegate);
                }
            }
        }
    }

    fn delegate(
        &mut self,
        parent: &Arc<HttpRouteIr>,
        reached_by: &ParentRef,
        matcher: &HttpRouteMatch,
        delegate: &DelegateRef,
    ) {
        let children = match self.children(&parent.source, delegate) {
            Ok(children) => children,
            Err(error) => {
                tracing::debug!(route = %parent.source, %error, "Unresolved delegation");
                let reason = match error {
                    DelegationError::NotFound(_) => reason::BACKEND_NOT_FOUND,
                    _ => reason::UNRESOLVED_REFERENCE,
                };
                self.reports
                    .parent_ref(&parent.source, reached_by)
                    .set_condition(ConditionReport::new(
                        condition::RESOLVED_REFS,
                        false,
                        reason,
                        error.to_string(),
                    ));
                return;
            }
        };

        let child_ref = route_parent_ref(&parent.source);
        for child in children {
            let error = if self.visited.contains(&child.source) {
                Some((reason::CYCLIC_REFERENCE, DelegationError::CyclicReference(child.source.clone())))
            } else if !child.hostnames.is_empty() {
                Some((reason::UNSUPPORTED_VALUE, DelegationError::ChildHostnames(child.source.clone())))
            } else {
                None
            };
            if let Some((reason, error)) = error {
                tracing::debug!(route = %parent.source, child = %child.source, %error, "Invalid child route");
                self.reports
                    .parent_ref(&child.source, &child_ref)
                    .set_condition(ConditionReport::new(
                        condition::ACCEPTED,
                        false,
                        reason,
                        error.to_string(),
                    ));
                continue;
            }

            self.reports.parent_ref(&child.source, &child_ref);

            let child = Arc::new(HttpRouteIr {
                hostnames: parent.hostnames.clone(),
                ..(*child).clone()
            });
            self.visited.insert(child.source.clone());
            self.chain.push(child.source.clone());
            self.flatten(&child, &child_ref, Some(matcher));
            self.chain.pop();
            self.visited.remove(&child.source);
        }
    }

    fn children(
        &mut self,
        parent: &ObjectSource,
        delegate: &DelegateRef,
    ) -> Result<Vec<Arc<HttpRouteIr>>, DelegationError> {
        match &delegate.name {
            Some(name) => {
                let child = self
                    .routes
                    .fetch_http_route(self.ctx, &delegate.namespace, name)
                    .ok_or_else(|| DelegationError::NotFound(delegate.clone()))?;
                Ok(vec![child])
            }
            None => {
                let children = self
                    .routes
                    .http_routes_in_namespace(self.ctx, &delegate.namespace)
                    .into_iter()
                    .filter(|child| child.source != *parent && accepts_parent(child, parent))
                    .collect::<Vec<_>>();
                if children.is_empty() {
                    return Err(DelegationError::UnresolvedReference(delegate.clone()));
                }
                Ok(children)
            }
        }
    }
}

/// A child selected by wildcard must either name no parent routes or name
/// this one. Routes attached only to gateways are not children.
fn accepts_parent(child: &HttpRouteIr, parent: &ObjectSource) -> bool {
    let mut route_refs = child
        .parent_refs
        .iter()
        .filter(|p| p.group_kind() == GroupKind::http_route())
        .peekable();
    if route_refs.peek().is_none() {
        return child.parent_refs.is_empty();
    }
    route_refs.any(|p| p.name == parent.name && p.namespace_or(&child.source.namespace) == parent.namespace)
}

pub fn rule_match_name(route: &ObjectSource, rule_index: usize, match_index: usize) -> String {
    format!(
        "{}.{}-rule-{rule_index}-match-{match_index}",
        route.namespace, route.name
    )
}

/// A child match is delegated by a parent match when the parent path covers
/// the child path and every header, query parameter, and method the parent
/// requires is also required by the child.
pub fn is_delegated_route_match(parent: &HttpRouteMatch, child: &HttpRouteMatch) -> bool {
    let path_ok = match (&parent.path, &child.path) {
        (PathMatch::PathPrefix(p), PathMatch::PathPrefix(c) | PathMatch::Exact(c)) => {
            path_has_prefix(c, p)
        }
        (PathMatch::Exact(p), PathMatch::Exact(c)) => p == c,
        (PathMatch::RegularExpression(p), PathMatch::RegularExpression(c)) => p == c,
        _ => false,
    };
    if !path_ok {
        return false;
    }

    if !parent.headers.iter().all(|h| child.headers.contains(h)) {
        return false;
    }
    if !parent
        .query_params
        .iter()
        .all(|q| child.query_params.contains(q))
    {
        return false;
    }

    match &parent.method {
        None => true,
        Some(m) => child.method.as_ref() == Some(m),
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
        None => false,
    }
}
