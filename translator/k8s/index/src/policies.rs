use kgateway_translator_collections::{Collection, HandlerContext, Index, Join, Keyed};
use kgateway_translator_core::{
    policy::{AttachedPolicies, PolicyAtt, PolicyIr},
    GroupKind, ObjectSource, Time,
};
use std::sync::Arc;

/// A policy object contributed by a plugin, with the resources it targets.
#[derive(Clone, Debug)]
pub struct PolicyWrapper {
    pub source: ObjectSource,
    pub creation: Option<Time>,
    /// Target references are local to the policy's namespace.
    pub target_refs: Vec<PolicyTargetRef>,
    pub policy: Arc<dyn PolicyIr>,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PolicyTargetRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub section_name: Option<String>,
}

/// Attaches plugin policies to the resources they target.
pub struct PolicyIndex {
    policies: Arc<Join<PolicyWrapper>>,
    by_target: Arc<Index<PolicyWrapper>>,
}

fn target_key(group: &str, kind: &str, ns: &str, name: &str, section: Option<&str>) -> String {
    match section {
        Some(section) => format!("{group}/{kind}/{ns}/{name}#{section}"),
        None => format!("{group}/{kind}/{ns}/{name}"),
    }
}

// === impl PolicyWrapper ===

impl Keyed for PolicyWrapper {
    fn key(&self) -> String {
        self.source.resource_name()
    }
}

impl PartialEq for PolicyWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.creation == other.creation
            && self.target_refs == other.target_refs
            && self.errors == other.errors
            && self.policy.policy_eq(other.policy.as_ref())
    }
}

impl PolicyWrapper {
    fn attachment(&self) -> PolicyAtt {
        let mut att = PolicyAtt::new(self.source.group_kind(), self.policy.clone())
            .with_ref(self.source.clone());
        att.errors.clone_from(&self.errors);
        att
    }
}

// === impl PolicyIndex ===

impl PolicyIndex {
    pub fn new(collections: Vec<Arc<dyn Collection<PolicyWrapper>>>) -> Self {
        let policies = Join::new("policies", collections);
        let by_target = Index::new("policies-by-target", policies.clone(), |p: &PolicyWrapper| {
            p.target_refs
                .iter()
                .map(|t| {
                    target_key(
                        &t.group,
                        &t.kind,
                        &p.source.namespace,
                        &t.name,
                        t.section_name.as_deref(),
                    )
                })
                .collect()
        });
        Self {
            policies,
            by_target,
        }
    }

    /// Policies that target `target` as a whole or, when a section is given,
    /// only those that target that section of it. Policies are ordered by
    /// creation time, then by namespace and name.
    pub fn policies_for(
        &self,
        ctx: &mut HandlerContext<'_>,
        target: &ObjectSource,
        section_name: Option<&str>,
    ) -> AttachedPolicies {
        let key = target_key(
            &target.group,
            &target.kind,
            &target.namespace,
            &target.name,
            section_name,
        );
        let mut policies = ctx.fetch_index(&self.by_target, &key);
        sort_policies(&mut policies);
        policies.iter().map(|p| p.attachment()).collect()
    }

    /// Fetches a policy by reference, e.g. for an `ExtensionRef` filter.
    pub fn fetch_policy(
        &self,
        ctx: &mut HandlerContext<'_>,
        policy: &ObjectSource,
    ) -> Option<PolicyAtt> {
        let policy = ctx.fetch_one(self.policies.as_ref(), &policy.resource_name())?;
        Some(PolicyAtt::new(policy.source.group_kind(), policy.policy.clone()))
    }

    pub fn kinds(&self) -> Vec<GroupKind> {
        let mut kinds = self
            .policies
            .list()
            .iter()
            .map(|p| p.source.group_kind())
            .collect::<Vec<_>>();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn collection(&self) -> &Arc<Join<PolicyWrapper>> {
        &self.policies
    }
}

fn sort_policies(policies: &mut [Arc<PolicyWrapper>]) {
    policies.sort_by(|a, b| {
        let ta = a.creation.as_ref().map(|t| t.0);
        let tb = b.creation.as_ref().map(|t| t.0);
        ta.cmp(&tb)
            .then_with(|| a.source.namespace.cmp(&b.source.namespace))
            .then_with(|| a.source.name.cmp(&b.source.name))
    });
}
