use kgateway_translator_collections::{Collection, HandlerContext, Index, StaticCollection};
use kgateway_translator_core::{GroupKind, ObjectSource, CORE_GROUP};
use kgateway_translator_k8s_api::{gateway_api::ReferenceGrant, ResourceExt};
use std::sync::Arc;

/// Answers whether a cross-namespace reference is permitted by a
/// `ReferenceGrant` in the target namespace.
pub struct ReferenceGrants {
    grants: Arc<StaticCollection<ReferenceGrant>>,
    index: Arc<Index<ReferenceGrant>>,
}

/// Index keys for every (from, to) pair of a grant. Grants that do not
/// name a target object are indexed with an empty name.
fn grant_keys(grant: &ReferenceGrant) -> Vec<String> {
    let ns = grant.namespace().unwrap_or_default();
    let mut keys = Vec::with_capacity(grant.spec.from.len() * grant.spec.to.len());
    for from in &grant.spec.from {
        let from_gk = GroupKind::new(empty_if_core(&from.group), from.kind.clone());
        for to in &grant.spec.to {
            let to_gk = GroupKind::new(empty_if_core(&to.group), to.kind.clone());
            keys.push(index_key(
                &ns,
                &to_gk,
                to.name.as_deref().unwrap_or_default(),
                &from_gk,
                &from.namespace,
            ));
        }
    }
    keys
}

fn index_key(
    grant_ns: &str,
    to_gk: &GroupKind,
    to_name: &str,
    from_gk: &GroupKind,
    from_ns: &str,
) -> String {
    format!(
        "{grant_ns}|{}/{}|{to_name}|{}/{}|{from_ns}",
        to_gk.group, to_gk.kind, from_gk.group, from_gk.kind
    )
}

pub(crate) fn empty_if_core(group: &str) -> &str {
    if group == CORE_GROUP {
        return "";
    }
    group
}

// === impl ReferenceGrants ===

impl ReferenceGrants {
    pub fn new(grants: Arc<StaticCollection<ReferenceGrant>>) -> Self {
        let index = Index::new("reference-grants-by-target", grants.clone(), grant_keys);
        Self { grants, index }
    }

    pub fn grants(&self) -> &Arc<StaticCollection<ReferenceGrant>> {
        &self.grants
    }

    /// References within a namespace are always allowed. Otherwise a grant in
    /// the target's namespace must name the referring kind and namespace, and
    /// the target kind either without a name or with the target's name.
    pub fn reference_allowed(
        &self,
        ctx: &mut HandlerContext<'_>,
        from_gk: &GroupKind,
        from_ns: &str,
        to: &ObjectSource,
    ) -> bool {
        if from_ns == to.namespace {
            return true;
        }

        let from_gk = GroupKind::new(empty_if_core(&from_gk.group), from_gk.kind.clone());
        let to_gk = GroupKind::new(empty_if_core(&to.group), to.kind.clone());

        let any_name = index_key(&to.namespace, &to_gk, "", &from_gk, from_ns);
        if !ctx.fetch_index(&self.index, &any_name).is_empty() {
            return true;
        }

        let named = index_key(&to.namespace, &to_gk, &to.name, &from_gk, from_ns);
        !ctx.fetch_index(&self.index, &named).is_empty()
    }

    pub fn len(&self) -> usize {
        self.grants.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mk_refgrant;
    use kgateway_translator_collections::{Derived, Keyed};

    #[derive(Debug, PartialEq)]
    struct Allowed(bool);

    impl Keyed for Allowed {
        fn key(&self) -> String {
            "allowed".to_string()
        }
    }

    fn backend(ns: &str, name: &str) -> ObjectSource {
        ObjectSource::new(GroupKind::service(), ns, name)
    }

    #[test]
    fn same_namespace_needs_no_grant() {
        let grants = ReferenceGrants::new(StaticCollection::for_resource("grants").shared());
        let allowed = Derived::from_nothing("allowed", move |ctx| {
            Some(Allowed(grants.reference_allowed(
                ctx,
                &GroupKind::http_route(),
                "ns",
                &backend("ns", "web"),
            )))
        });
        assert!(allowed.get("allowed").unwrap().0);
    }

    #[test]
    fn grants_are_matched_reactively() {
        let input = StaticCollection::for_resource("grants").shared();
        let grants = Arc::new(ReferenceGrants::new(input.clone()));

        let check = {
            let grants = grants.clone();
            Derived::from_nothing("allowed", move |ctx| {
                Some(Allowed(grants.reference_allowed(
                    ctx,
                    &GroupKind::http_route(),
                    "default",
                    &backend("backends", "web"),
                )))
            })
        };
        assert!(!check.get("allowed").unwrap().0);

        // A grant for another kind does not help.
        input.apply(mk_refgrant(
            "backends",
            "grant-secret",
            ("gateway.networking.k8s.io", "HTTPRoute", "default"),
            ("", "Secret", None),
        ));
        assert!(!check.get("allowed").unwrap().0);

        input.apply(mk_refgrant(
            "backends",
            "grant-svc",
            ("gateway.networking.k8s.io", "HTTPRoute", "default"),
            ("core", "Service", Some("web")),
        ));
        assert!(check.get("allowed").unwrap().0);

        input.delete("backends/grant-svc");
        assert!(!check.get("allowed").unwrap().0);
    }

    #[test]
    fn grant_name_must_match_when_set() {
        let input = StaticCollection::for_resource("grants").shared();
        input.apply(mk_refgrant(
            "backends",
            "grant",
            ("gateway.networking.k8s.io", "HTTPRoute", "default"),
            ("", "Service", Some("other")),
        ));
        let grants = Arc::new(ReferenceGrants::new(input));
        let check = Derived::from_nothing("allowed", move |ctx| {
            Some(Allowed(grants.reference_allowed(
                ctx,
                &GroupKind::http_route(),
                "default",
                &backend("backends", "web"),
            )))
        });
        assert!(!check.get("allowed").unwrap().0);
    }

    #[test]
    fn grant_from_namespace_must_match() {
        let input = StaticCollection::for_resource("grants").shared();
        input.apply(mk_refgrant(
            "backends",
            "grant",
            ("gateway.networking.k8s.io", "HTTPRoute", "elsewhere"),
            ("", "Service", None),
        ));
        let grants = Arc::new(ReferenceGrants::new(input));
        assert_eq!(grants.len(), 1);
        let check = Derived::from_nothing("allowed", move |ctx| {
            Some(Allowed(grants.reference_allowed(
                ctx,
                &GroupKind::http_route(),
                "default",
                &backend("backends", "web"),
            )))
        });
        assert!(!check.get("allowed").unwrap().0);
    }
}
