use std::fmt;

/// The group used for core Kubernetes kinds when a reference must name one
/// explicitly.
pub const CORE_GROUP: &str = "core";

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

/// Identifies any resource that may be referenced by another resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectSource {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

// === impl GroupKind ===

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn service() -> Self {
        Self::new("", "Service")
    }

    pub fn secret() -> Self {
        Self::new("", "Secret")
    }

    pub fn gateway() -> Self {
        Self::new(GATEWAY_GROUP, "Gateway")
    }

    pub fn http_route() -> Self {
        Self::new(GATEWAY_GROUP, "HTTPRoute")
    }

    pub fn tcp_route() -> Self {
        Self::new(GATEWAY_GROUP, "TCPRoute")
    }

    pub fn tls_route() -> Self {
        Self::new(GATEWAY_GROUP, "TLSRoute")
    }

    /// Treats the empty group and `core` as the same group.
    pub fn normalized(&self) -> Self {
        if self.group.is_empty() {
            return Self::new(CORE_GROUP, self.kind.clone());
        }
        self.clone()
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            return f.write_str(&self.kind);
        }
        write!(f, "{}.{}", self.kind, self.group)
    }
}

// === impl ObjectSource ===

impl ObjectSource {
    pub fn new(
        gk: GroupKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: gk.group,
            kind: gk.kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    /// The key under which collections store this object.
    pub fn resource_name(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }

    /// The `namespace/name` key of the object.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ObjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kind_normalizes_the_core_group() {
        assert_eq!(GroupKind::service().normalized(), GroupKind::new("core", "Service"));
        assert_eq!(GroupKind::gateway().normalized(), GroupKind::gateway());
    }

    #[test]
    fn display() {
        assert_eq!(GroupKind::service().to_string(), "Service");
        assert_eq!(
            GroupKind::http_route().to_string(),
            "HTTPRoute.gateway.networking.k8s.io"
        );
        let src = ObjectSource::new(GroupKind::service(), "ns", "name");
        assert_eq!(src.to_string(), "Service/ns/name");
        assert_eq!(src.resource_name(), "/Service/ns/name");
    }
}
