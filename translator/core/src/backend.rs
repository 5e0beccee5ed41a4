use crate::{policy::AttachedPolicies, GroupKind, ObjectSource};
use kgateway_translator_collections::Keyed;
use std::{any::Any, fmt, sync::Arc};

/// A resolved destination for traffic, e.g. a Service port.
#[derive(Clone)]
pub struct BackendObjectIr {
    pub source: ObjectSource,
    pub port: u16,
    pub app_protocol: Option<String>,

    /// The underlying object, owned by the plugin that contributed the
    /// backend kind.
    pub obj: Arc<dyn Any + Send + Sync>,

    /// The resource version of the underlying object. Two backends with the
    /// same source, port and version are considered equal.
    pub version: Option<String>,

    pub attached_policies: AttachedPolicies,
}

/// A reference from a route to a backend, before resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendRef {
    pub group_kind: GroupKind,
    pub namespace: Option<String>,
    pub name: String,
    pub port: Option<u16>,
}

/// A route's reference to a backend, after resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendRefIr {
    /// The name of the cluster that serves the backend. When resolution
    /// fails, this names a blackhole cluster so that routes still see a
    /// consistent set of weights.
    pub cluster_name: String,
    pub weight: u32,
    pub backend: Result<Arc<BackendObjectIr>, BackendError>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown backend kind {0}")]
    UnknownBackendKind(GroupKind),

    #[error("backend {reference} not found")]
    NotFound { reference: ObjectSource },

    #[error("missing reference grant for {0}")]
    MissingReferenceGrant(ObjectSource),

    #[error("backend {0} must specify a port")]
    MissingPort(ObjectSource),
}

pub const BLACKHOLE_CLUSTER_NAME: &str = "blackhole_cluster";

/// Formats the collection key of a backend.
pub fn backend_resource_name(source: &ObjectSource, port: u16) -> String {
    format!("{}:{}", source.resource_name(), port)
}

// === impl BackendObjectIr ===

impl BackendObjectIr {
    pub fn new(source: ObjectSource, port: u16, obj: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            source,
            port,
            app_protocol: None,
            obj,
            version: None,
            attached_policies: AttachedPolicies::default(),
        }
    }

    pub fn resource_name(&self) -> String {
        backend_resource_name(&self.source, self.port)
    }

    /// The name of the proxy cluster for this backend.
    pub fn cluster_name(&self) -> String {
        let kind = if self.source.kind == "Service" && self.source.group.is_empty() {
            "kube".to_string()
        } else {
            self.source.kind.to_lowercase()
        };
        format!(
            "{}_{}_{}_{}",
            kind, self.source.namespace, self.source.name, self.port
        )
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.obj.downcast_ref()
    }
}

impl Keyed for BackendObjectIr {
    fn key(&self) -> String {
        self.resource_name()
    }
}

impl fmt::Debug for BackendObjectIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendObjectIr")
            .field("source", &self.source)
            .field("port", &self.port)
            .field("app_protocol", &self.app_protocol)
            .field("version", &self.version)
            .field("attached_policies", &self.attached_policies)
            .finish_non_exhaustive()
    }
}

impl PartialEq for BackendObjectIr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.port == other.port
            && self.app_protocol == other.app_protocol
            && self.version == other.version
            && self.attached_policies == other.attached_policies
    }
}

// === impl BackendRefIr ===

impl BackendRefIr {
    pub fn resolved(backend: Arc<BackendObjectIr>, weight: u32) -> Self {
        Self {
            cluster_name: backend.cluster_name(),
            weight,
            backend: Ok(backend),
        }
    }

    pub fn failed(error: BackendError, weight: u32) -> Self {
        Self {
            cluster_name: BLACKHOLE_CLUSTER_NAME.to_string(),
            weight,
            backend: Err(error),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.backend.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_cluster_names() {
        let src = ObjectSource::new(GroupKind::service(), "default", "web");
        let backend = BackendObjectIr::new(src, 8080, Arc::new(()));
        assert_eq!(backend.cluster_name(), "kube_default_web_8080");
        assert_eq!(backend.resource_name(), "/Service/default/web:8080");
    }

    #[test]
    fn equality_ignores_the_opaque_object() {
        let src = ObjectSource::new(GroupKind::service(), "default", "web");
        let a = BackendObjectIr::new(src.clone(), 80, Arc::new(1u32));
        let b = BackendObjectIr::new(src, 80, Arc::new(2u32));
        assert_eq!(a, b);

        let mut c = a.clone();
        c.version = Some("2".to_string());
        assert_ne!(a, c);
    }
}
