use crate::refgrants::{empty_if_core, ReferenceGrants};
use kgateway_translator_collections::{Collection, Derived, HandlerContext, StaticCollection};
use kgateway_translator_core::{
    backend::{backend_resource_name, BackendError, BackendObjectIr, BackendRef, BackendRefIr},
    GroupKind, ObjectSource,
};
use kgateway_translator_k8s_api::{gateway_api, ResourceExt, Service};
use std::{collections::BTreeMap, sync::Arc};

/// Resolves backend references against the backend collections registered
/// for each backend kind.
pub struct BackendIndex {
    refgrants: Arc<ReferenceGrants>,
    by_kind: BTreeMap<GroupKind, Arc<dyn Collection<BackendObjectIr>>>,
}

/// Produces one backend per service port.
pub fn service_backends(services: Arc<StaticCollection<Service>>) -> Arc<Derived<Service, BackendObjectIr>> {
    Derived::many("service-backends", services, |_, svc: &Service| {
        service_to_backends(svc)
    })
}

fn service_to_backends(svc: &Service) -> Vec<BackendObjectIr> {
    let ns = svc.namespace().unwrap_or_default();
    let name = svc.name_unchecked();
    let obj: Arc<Service> = Arc::new(svc.clone());
    let ports = svc.spec.as_ref().and_then(|s| s.ports.as_ref());
    ports
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok()?;
            let mut backend = BackendObjectIr::new(
                ObjectSource::new(GroupKind::service(), ns.clone(), name.clone()),
                port,
                obj.clone(),
            );
            backend.app_protocol.clone_from(&p.app_protocol);
            backend.version.clone_from(&svc.metadata.resource_version);
            Some(backend)
        })
        .collect()
}

/// Converts an API backend reference into its core form.
pub fn backend_ref(r: &gateway_api::BackendObjectReference) -> BackendRef {
    BackendRef {
        group_kind: GroupKind::new(
            r.group.as_deref().unwrap_or_default(),
            r.kind.as_deref().unwrap_or("Service"),
        ),
        namespace: r.namespace.clone(),
        name: r.name.clone(),
        port: r.port.and_then(|p| u16::try_from(p).ok()),
    }
}

/// Route weights default to 1. Negative weights are invalid and treated as 0.
pub fn weight(w: Option<i32>) -> u32 {
    match w {
        None => 1,
        Some(w) => u32::try_from(w).unwrap_or(0),
    }
}

// === impl BackendIndex ===

impl BackendIndex {
    pub fn new(refgrants: Arc<ReferenceGrants>) -> Self {
        Self {
            refgrants,
            by_kind: BTreeMap::new(),
        }
    }

    /// Registers the backend collection for a kind. The empty group and
    /// `core` name the same group.
    pub fn register<C>(&mut self, gk: GroupKind, backends: Arc<C>)
    where
        C: Collection<BackendObjectIr> + 'static,
    {
        let gk = GroupKind::new(empty_if_core(&gk.group), gk.kind);
        self.by_kind.insert(gk, backends);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &GroupKind> {
        self.by_kind.keys()
    }

    pub fn collections(&self) -> impl Iterator<Item = &Arc<dyn Collection<BackendObjectIr>>> {
        self.by_kind.values()
    }

    pub fn refgrants(&self) -> &Arc<ReferenceGrants> {
        &self.refgrants
    }

    /// Resolves a reference made by `from`. The reference's namespace
    /// defaults to the namespace of `from`.
    pub fn get_backend_from_ref(
        &self,
        ctx: &mut HandlerContext<'_>,
        from: &ObjectSource,
        r: &BackendRef,
    ) -> Result<Arc<BackendObjectIr>, BackendError> {
        let gk = GroupKind::new(empty_if_core(&r.group_kind.group), r.group_kind.kind.clone());
        let to = ObjectSource::new(
            gk.clone(),
            r.namespace.as_deref().unwrap_or(&from.namespace),
            r.name.clone(),
        );

        if !self
            .refgrants
            .reference_allowed(ctx, &from.group_kind(), &from.namespace, &to)
        {
            return Err(BackendError::MissingReferenceGrant(to));
        }

        let backends = self
            .by_kind
            .get(&gk)
            .ok_or_else(|| BackendError::UnknownBackendKind(gk.clone()))?;

        let port = r.port.ok_or_else(|| BackendError::MissingPort(to.clone()))?;

        ctx.fetch_one(backends.as_ref(), &backend_resource_name(&to, port))
            .ok_or(BackendError::NotFound { reference: to })
    }

    /// Resolves a weighted reference, falling back to the blackhole cluster
    /// when resolution fails.
    pub fn resolve(
        &self,
        ctx: &mut HandlerContext<'_>,
        from: &ObjectSource,
        r: &BackendRef,
        weight: u32,
    ) -> BackendRefIr {
        match self.get_backend_from_ref(ctx, from, r) {
            Ok(backend) => BackendRefIr::resolved(backend, weight),
            Err(error) => {
                tracing::debug!(%from, backend = %r.name, %error, "Unresolved backend");
                BackendRefIr::failed(error, weight)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_refgrant, mk_service};
    use kgateway_translator_collections::Keyed;
    use kgateway_translator_core::backend::BLACKHOLE_CLUSTER_NAME;

    #[derive(Debug, PartialEq)]
    struct Resolved(BackendRefIr);

    impl Keyed for Resolved {
        fn key(&self) -> String {
            String::new()
        }
    }

    fn route() -> ObjectSource {
        ObjectSource::new(GroupKind::http_route(), "default", "route")
    }

    fn svc_ref(ns: Option<&str>, name: &str, port: Option<u16>) -> BackendRef {
        BackendRef {
            group_kind: GroupKind::service(),
            namespace: ns.map(Into::into),
            name: name.to_string(),
            port,
        }
    }

    struct Fixture {
        services: Arc<StaticCollection<Service>>,
        grants: Arc<StaticCollection<gateway_api::ReferenceGrant>>,
        index: Arc<BackendIndex>,
    }

    fn fixture() -> Fixture {
        let services = StaticCollection::for_resource("services").shared();
        let grants = StaticCollection::for_resource("grants").shared();
        let mut index = BackendIndex::new(Arc::new(ReferenceGrants::new(grants.clone())));
        index.register(GroupKind::service(), service_backends(services.clone()));
        Fixture {
            services,
            grants,
            index: Arc::new(index),
        }
    }

    fn resolve(f: &Fixture, r: BackendRef) -> Arc<Derived<(), Resolved>> {
        let index = f.index.clone();
        Derived::from_nothing("resolved", move |ctx| {
            Some(Resolved(index.resolve(ctx, &route(), &r, 1)))
        })
    }

    #[test]
    fn every_service_port_is_a_backend() {
        let svc = mk_service("default", "web", &[("http", 80), ("admin", 9990)]);
        let backends = service_to_backends(&svc);
        let names = backends
            .iter()
            .map(BackendObjectIr::cluster_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["kube_default_web_80", "kube_default_web_9990"]);
        assert!(backends[0].downcast::<Service>().is_some());
    }

    #[test]
    fn resolution_errors() {
        let f = fixture();
        f.services
            .apply(mk_service("default", "web", &[("http", 80)]));

        for (r, expected) in [
            (
                svc_ref(None, "web", Some(80)),
                Ok("kube_default_web_80".to_string()),
            ),
            (
                svc_ref(None, "web", Some(81)),
                Err(BackendError::NotFound {
                    reference: ObjectSource::new(GroupKind::service(), "default", "web"),
                }),
            ),
            (
                svc_ref(None, "web", None),
                Err(BackendError::MissingPort(ObjectSource::new(
                    GroupKind::service(),
                    "default",
                    "web",
                ))),
            ),
            (
                BackendRef {
                    group_kind: GroupKind::new("example.com", "Bucket"),
                    ..svc_ref(None, "web", Some(80))
                },
                Err(BackendError::UnknownBackendKind(GroupKind::new(
                    "example.com",
                    "Bucket",
                ))),
            ),
            (
                BackendRef {
                    group_kind: GroupKind::new("core", "Service"),
                    ..svc_ref(None, "web", Some(80))
                },
                Ok("kube_default_web_80".to_string()),
            ),
        ] {
            let resolved = resolve(&f, r.clone());
            let out = resolved.get("").unwrap();
            let got = out.0.backend.as_ref().map(|b| b.cluster_name()).map_err(Clone::clone);
            assert_eq!(got, expected, "{r:?}");
            if expected.is_err() {
                assert_eq!(out.0.cluster_name, BLACKHOLE_CLUSTER_NAME);
            }
        }
    }

    #[test]
    fn cross_namespace_backends_require_a_grant() {
        let f = fixture();
        f.services
            .apply(mk_service("backends", "web", &[("http", 80)]));

        let resolved = resolve(&f, svc_ref(Some("backends"), "web", Some(80)));
        assert_eq!(
            resolved.get("").unwrap().0.backend,
            Err(BackendError::MissingReferenceGrant(ObjectSource::new(
                GroupKind::service(),
                "backends",
                "web"
            )))
        );

        f.grants.apply(mk_refgrant(
            "backends",
            "allow-routes",
            ("gateway.networking.k8s.io", "HTTPRoute", "default"),
            ("", "Service", Some("web")),
        ));
        let out = resolved.get("").unwrap();
        assert!(out.0.is_resolved());
        assert_eq!(out.0.cluster_name, "kube_backends_web_80");
    }

    #[test]
    fn weights_default_to_one() {
        assert_eq!(weight(None), 1);
        assert_eq!(weight(Some(0)), 0);
        assert_eq!(weight(Some(7)), 7);
        assert_eq!(weight(Some(-1)), 0);
    }
}
