use crate::{GroupKind, ObjectSource, Time};
use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

/// A plugin-defined policy value.
///
/// Implementations decide what equality means for their policies. Values
/// whose content is fully determined by the resource that owns them may
/// report themselves as always equal and rely on that resource's own change
/// detection.
pub trait PolicyIr: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn policy_eq(&self, other: &dyn PolicyIr) -> bool;

    fn creation_time(&self) -> Option<&Time> {
        None
    }
}

/// A policy attached to a resource.
#[derive(Clone, Debug)]
pub struct PolicyAtt {
    pub group_kind: GroupKind,
    /// The policy object that contributed this attachment, if any. Builtin
    /// policies derived from a route's own spec have no separate source.
    pub policy_ref: Option<ObjectSource>,
    pub policy: Arc<dyn PolicyIr>,
    pub errors: Vec<String>,
}

/// Policies attached to a resource, grouped by the kind of the policy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttachedPolicies {
    pub policies: BTreeMap<GroupKind, Vec<PolicyAtt>>,
}

// === impl PolicyAtt ===

impl PolicyAtt {
    pub fn new(group_kind: GroupKind, policy: Arc<dyn PolicyIr>) -> Self {
        Self {
            group_kind,
            policy_ref: None,
            policy,
            errors: Vec::new(),
        }
    }

    pub fn with_ref(mut self, policy_ref: ObjectSource) -> Self {
        self.policy_ref = Some(policy_ref);
        self
    }
}

impl PartialEq for PolicyAtt {
    fn eq(&self, other: &Self) -> bool {
        self.group_kind == other.group_kind
            && self.policy_ref == other.policy_ref
            && self.errors == other.errors
            && self.policy.policy_eq(other.policy.as_ref())
    }
}

// === impl AttachedPolicies ===

impl AttachedPolicies {
    pub fn is_empty(&self) -> bool {
        self.policies.values().all(Vec::is_empty)
    }

    pub fn push(&mut self, att: PolicyAtt) {
        self.policies
            .entry(att.group_kind.clone())
            .or_default()
            .push(att);
    }

    /// Appends every attachment from `other` after the attachments already
    /// held for the same kind.
    pub fn append(&mut self, other: &AttachedPolicies) {
        for (gk, atts) in &other.policies {
            self.policies
                .entry(gk.clone())
                .or_default()
                .extend(atts.iter().cloned());
        }
    }

    pub fn get(&self, gk: &GroupKind) -> &[PolicyAtt] {
        self.policies.get(gk).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyAtt> {
        self.policies.values().flatten()
    }
}

impl FromIterator<PolicyAtt> for AttachedPolicies {
    fn from_iter<T: IntoIterator<Item = PolicyAtt>>(iter: T) -> Self {
        let mut policies = Self::default();
        for att in iter {
            policies.push(att);
        }
        policies
    }
}
