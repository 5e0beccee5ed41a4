//! Status reports accumulated during translation.
//!
//! Translation only records the conditions it has something to say about.
//! Conditions that were never set are assumed to be healthy when the report
//! is turned into a resource status.

use crate::{route::ParentRef, GroupKind, ObjectSource};
use std::collections::BTreeMap;

pub mod condition {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const CONFLICTED: &str = "Conflicted";
    pub const PARTIALLY_INVALID: &str = "PartiallyInvalid";
}

pub mod reason {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const NO_CONFLICTS: &str = "NoConflicts";
    pub const INVALID: &str = "Invalid";
    pub const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
    pub const INVALID_ROUTE_KINDS: &str = "InvalidRouteKinds";
    pub const INVALID_KIND: &str = "InvalidKind";
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
    pub const REF_NOT_PERMITTED: &str = "RefNotPermitted";
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";
    pub const NO_MATCHING_LISTENER_HOSTNAME: &str = "NoMatchingListenerHostname";
    pub const UNSUPPORTED_PROTOCOL: &str = "UnsupportedProtocol";
    pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";
    pub const UNRESOLVED_REFERENCE: &str = "UnresolvedReference";
    pub const CYCLIC_REFERENCE: &str = "CyclicReference";
    pub const INVALID_CHILD: &str = "InvalidChild";
    pub const MULTIPLE_ROUTES: &str = "MultipleRoutes";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionReport {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

/// Reports about every object touched by a translation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportMap {
    pub gateways: BTreeMap<ObjectSource, GatewayReport>,
    pub routes: BTreeMap<ObjectSource, RouteReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayReport {
    pub observed_generation: Option<i64>,
    pub conditions: Vec<ConditionReport>,
    pub listeners: BTreeMap<String, ListenerReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerReport {
    pub supported_kinds: Vec<GroupKind>,
    pub attached_routes: u32,
    pub conditions: Vec<ConditionReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub observed_generation: Option<i64>,
    /// Reports per parent reference, in the order they were first reported.
    pub parents: Vec<(ParentRef, ParentRefReport)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentRefReport {
    pub conditions: Vec<ConditionReport>,
}

// === impl ConditionReport ===

impl ConditionReport {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Replaces the condition of the same type, or appends it.
fn set_condition(conditions: &mut Vec<ConditionReport>, cond: ConditionReport) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => *existing = cond,
        None => conditions.push(cond),
    }
}

fn find_condition<'c>(conditions: &'c [ConditionReport], type_: &str) -> Option<&'c ConditionReport> {
    conditions.iter().find(|c| c.type_ == type_)
}

// === impl ReportMap ===

impl ReportMap {
    pub fn gateway(&mut self, gateway: &ObjectSource) -> &mut GatewayReport {
        self.gateways.entry(gateway.clone()).or_default()
    }

    pub fn route(&mut self, route: &ObjectSource) -> &mut RouteReport {
        self.routes.entry(route.clone()).or_default()
    }

    pub fn parent_ref(&mut self, route: &ObjectSource, parent: &ParentRef) -> &mut ParentRefReport {
        self.route(route).parent_ref(parent)
    }

    /// Folds another report into this one. Route reports from several
    /// gateways are combined per parent reference.
    pub fn merge(&mut self, other: &ReportMap) {
        for (gw, report) in &other.gateways {
            self.gateways.insert(gw.clone(), report.clone());
        }
        for (route, report) in &other.routes {
            let into = self.route(route);
            if report.observed_generation.is_some() {
                into.observed_generation = report.observed_generation;
            }
            for (parent, pr) in &report.parents {
                let into = into.parent_ref(parent);
                for cond in &pr.conditions {
                    set_condition(&mut into.conditions, cond.clone());
                }
            }
        }
    }
}

// === impl GatewayReport ===

impl GatewayReport {
    pub fn set_condition(&mut self, cond: ConditionReport) {
        set_condition(&mut self.conditions, cond);
    }

    pub fn condition(&self, type_: &str) -> Option<&ConditionReport> {
        find_condition(&self.conditions, type_)
    }

    pub fn listener(&mut self, name: &str) -> &mut ListenerReport {
        self.listeners.entry(name.to_string()).or_default()
    }
}

// === impl ListenerReport ===

impl ListenerReport {
    pub fn set_condition(&mut self, cond: ConditionReport) {
        set_condition(&mut self.conditions, cond);
    }

    pub fn condition(&self, type_: &str) -> Option<&ConditionReport> {
        find_condition(&self.conditions, type_)
    }
}

// === impl RouteReport ===

impl RouteReport {
    pub fn parent_ref(&mut self, parent: &ParentRef) -> &mut ParentRefReport {
        let idx = match self.parents.iter().position(|(p, _)| p == parent) {
            Some(idx) => idx,
            None => {
                self.parents.push((parent.clone(), ParentRefReport::default()));
                self.parents.len() - 1
            }
        };
        &mut self.parents[idx].1
    }

    pub fn get(&self, parent: &ParentRef) -> Option<&ParentRefReport> {
        self.parents.iter().find(|(p, _)| p == parent).map(|(_, r)| r)
    }
}

// === impl ParentRefReport ===

impl ParentRefReport {
    pub fn set_condition(&mut self, cond: ConditionReport) {
        set_condition(&mut self.conditions, cond);
    }

    pub fn condition(&self, type_: &str) -> Option<&ConditionReport> {
        find_condition(&self.conditions, type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> ObjectSource {
        ObjectSource::new(GroupKind::http_route(), "ns", "route")
    }

    #[test]
    fn conditions_are_replaced_by_type() {
        let mut report = ReportMap::default();
        let parent = ParentRef::gateway(None, "gw");
        report.parent_ref(&route(), &parent).set_condition(ConditionReport::new(
            condition::RESOLVED_REFS,
            false,
            reason::BACKEND_NOT_FOUND,
            "missing",
        ));
        report.parent_ref(&route(), &parent).set_condition(ConditionReport::new(
            condition::RESOLVED_REFS,
            false,
            reason::REF_NOT_PERMITTED,
            "denied",
        ));

        let pr = report.routes[&route()].get(&parent).unwrap();
        assert_eq!(pr.conditions.len(), 1);
        assert_eq!(
            pr.condition(condition::RESOLVED_REFS).unwrap().reason,
            reason::REF_NOT_PERMITTED
        );
    }

    #[test]
    fn merge_combines_parents_of_one_route() {
        let a_ref = ParentRef::gateway(None, "a");
        let b_ref = ParentRef::gateway(None, "b");

        let mut a = ReportMap::default();
        a.parent_ref(&route(), &a_ref);
        let mut b = ReportMap::default();
        b.parent_ref(&route(), &b_ref).set_condition(ConditionReport::new(
            condition::ACCEPTED,
            false,
            reason::NO_MATCHING_PARENT,
            "",
        ));

        a.merge(&b);
        let parents = a.routes[&route()]
            .parents
            .iter()
            .map(|(p, _)| p.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(parents, vec!["a", "b"]);
    }
}
