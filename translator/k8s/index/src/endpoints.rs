use crate::pods::LocalityPods;
use kgateway_translator_collections::{
    Collection, Derived, HandlerContext, Index, StaticCollection,
};
use kgateway_translator_core::{
    backend::BackendObjectIr,
    endpoints::{
        EndpointMetadata, EndpointWithMd, EndpointsForBackend, FilterMetadata, LbEndpoint,
        PodLocality,
    },
};
use kgateway_translator_k8s_api::{EndpointSlice, ResourceExt, Service, ServicePort};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

/// The label that associates an EndpointSlice with its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// The pod label that marks a workload as part of the Istio mesh.
pub const ISTIO_TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";

pub const TRANSPORT_SOCKET_MATCH_KEY: &str = "envoy.transport_socket_match";

pub type BackendEndpoints = Derived<BackendObjectIr, EndpointsForBackend>;

#[derive(Clone)]
pub struct EndpointsInputs {
    pub backends: Arc<dyn Collection<BackendObjectIr>>,
    pub endpoint_slices: Arc<StaticCollection<EndpointSlice>>,
    pub pods: Arc<LocalityPods>,
    pub enable_auto_mtls: bool,
}

/// Indexes slices by `namespace/service`.
pub fn slices_by_service(
    slices: Arc<StaticCollection<EndpointSlice>>,
) -> Arc<Index<EndpointSlice>> {
    Index::new("endpoint-slices-by-service", slices, |slice: &EndpointSlice| {
        let ns = slice.namespace().unwrap_or_default();
        slice
            .labels()
            .get(SERVICE_NAME_LABEL)
            .map(|svc| vec![format!("{ns}/{svc}")])
            .unwrap_or_default()
    })
}

pub fn backend_endpoints(inputs: EndpointsInputs) -> Arc<BackendEndpoints> {
    let by_service = slices_by_service(inputs.endpoint_slices.clone());
    let EndpointsInputs {
        backends,
        pods,
        enable_auto_mtls,
        ..
    } = inputs;
    Derived::map("backend-endpoints", backends, move |ctx, backend: &BackendObjectIr| {
        endpoints_for_backend(ctx, &by_service, &pods, enable_auto_mtls, backend)
    })
}

fn endpoints_for_backend(
    ctx: &mut HandlerContext<'_>,
    by_service: &Index<EndpointSlice>,
    pods: &LocalityPods,
    enable_auto_mtls: bool,
    backend: &BackendObjectIr,
) -> Option<EndpointsForBackend> {
    // Only service backends have endpoint slices.
    let svc = backend.downcast::<Service>()?;
    let (svc_port, single_port) = match find_service_port(svc, backend.port) {
        Some(found) => found,
        None => {
            tracing::debug!(backend = %backend.source, port = backend.port, "Port not found for service");
            return None;
        }
    };

    let key = backend.source.namespaced_name();
    let slices = ctx.fetch_index(by_service, &key);
    if slices.is_empty() {
        tracing::debug!(service = %key, "No endpoint slices for service");
        return None;
    }

    // Slices may lag behind the service; only continue once one of them
    // carries the port.
    if !slices
        .iter()
        .any(|s| find_port_in_slice(s, single_port, svc_port).is_some())
    {
        tracing::debug!(service = %key, port = backend.port, "No endpoint slice ports for service");
        return None;
    }

    let mut out = EndpointsForBackend::new(
        backend.source.clone(),
        backend.port,
        backend.cluster_name(),
    );
    let mut seen = HashSet::new();
    for slice in &slices {
        let port = match find_port_in_slice(slice, single_port, svc_port) {
            Some(port) => port,
            None => continue,
        };
        let slice_ns = slice.namespace().unwrap_or_default();

        for ep in &slice.endpoints {
            if ep.conditions.as_ref().and_then(|c| c.ready) == Some(false) {
                continue;
            }

            for addr in &ep.addresses {
                if !seen.insert(addr.clone()) {
                    continue;
                }

                let pod = ep
                    .target_ref
                    .as_ref()
                    .filter(|r| r.kind.as_deref() == Some("Pod"))
                    .and_then(|r| {
                        let name = r.name.as_deref()?;
                        let ns = r
                            .namespace
                            .as_deref()
                            .filter(|ns| !ns.is_empty())
                            .unwrap_or(&slice_ns);
                        ctx.fetch_one(pods, &format!("{ns}/{name}"))
                    });
                let (locality, labels) = match pod {
                    Some(pod) => (pod.locality.clone(), pod.augmented_labels.clone()),
                    None => (PodLocality::default(), BTreeMap::new()),
                };

                out.add(
                    locality,
                    EndpointWithMd {
                        endpoint: lb_endpoint(addr, port, &labels, enable_auto_mtls),
                        md: EndpointMetadata { labels },
                    },
                );
            }
        }
    }

    tracing::debug!(backend = %backend.source, port = backend.port, endpoints = out.len(), "Built endpoints");
    Some(out)
}

/// Finds the service port serving `port`, and whether it is the service's
/// only port.
fn find_service_port(svc: &Service, port: u16) -> Option<(&ServicePort, bool)> {
    let ports = svc.spec.as_ref()?.ports.as_ref()?;
    ports
        .iter()
        .find(|p| p.port == i32::from(port))
        .map(|p| (p, ports.len() == 1))
}

/// Slice ports of a single-port service may be unnamed. Otherwise the slice
/// port must carry the service port's name.
fn find_port_in_slice(slice: &EndpointSlice, single_port: bool, svc_port: &ServicePort) -> Option<u32> {
    slice.ports.iter().flatten().find_map(|p| {
        let port = u32::try_from(p.port?).ok()?;
        if single_port || (p.name.is_some() && p.name == svc_port.name) {
            return Some(port);
        }
        None
    })
}

fn lb_endpoint(
    address: &str,
    port: u32,
    labels: &BTreeMap<String, String>,
    enable_auto_mtls: bool,
) -> LbEndpoint {
    let mut metadata = FilterMetadata::new();
    if enable_auto_mtls {
        if let Some(mode) = labels.get(ISTIO_TLS_MODE_LABEL) {
            metadata.insert(
                TRANSPORT_SOCKET_MATCH_KEY.to_string(),
                BTreeMap::from([("tlsMode".to_string(), mode.clone())]),
            );
        }
    }
    LbEndpoint {
        address: address.to_string(),
        port,
        load_balancing_weight: Some(1),
        metadata,
    }
}
