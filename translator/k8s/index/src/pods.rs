use kgateway_translator_collections::{Derived, HandlerContext, Keyed, StaticCollection};
use kgateway_translator_core::endpoints::PodLocality;
use kgateway_translator_k8s_api::{Node, Pod, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};

pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const SUBZONE_LABEL: &str = "topology.istio.io/subzone";

/// A pod with the locality of the node it is scheduled on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityPod {
    pub namespace: String,
    pub name: String,
    pub locality: PodLocality,
    pub pod_labels: BTreeMap<String, String>,
    /// The pod's labels plus the node's topology labels. No other node labels
    /// are carried.
    pub augmented_labels: BTreeMap<String, String>,
    pub addresses: Vec<String>,
}

pub type LocalityPods = Derived<Pod, LocalityPod>;

impl Keyed for LocalityPod {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

pub fn locality_pods(
    pods: Arc<StaticCollection<Pod>>,
    nodes: Arc<StaticCollection<Node>>,
) -> Arc<LocalityPods> {
    Derived::map("locality-pods", pods, move |ctx, pod: &Pod| {
        Some(locality_pod(ctx, &nodes, pod))
    })
}

fn locality_pod(
    ctx: &mut HandlerContext<'_>,
    nodes: &StaticCollection<Node>,
    pod: &Pod,
) -> LocalityPod {
    let node_name = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let node_labels = node_name
        .and_then(|n| ctx.fetch_one(nodes, n))
        .map(|node| node.labels().clone())
        .unwrap_or_default();

    let locality = locality_from_labels(&node_labels);
    let pod_labels = pod.labels().clone();
    let augmented_labels = augment_labels(&locality, &pod_labels);

    let addresses = pod
        .status
        .as_ref()
        .map(|status| {
            let ips = status.pod_ips.iter().flatten().map(|ip| ip.ip.clone());
            let mut addrs = ips.collect::<Vec<_>>();
            if addrs.is_empty() {
                addrs.extend(status.pod_ip.clone());
            }
            addrs
        })
        .unwrap_or_default();

    LocalityPod {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_unchecked(),
        locality,
        pod_labels,
        augmented_labels,
        addresses,
    }
}

pub fn locality_from_labels(labels: &BTreeMap<String, String>) -> PodLocality {
    let get = |k: &str| labels.get(k).cloned().unwrap_or_default();
    PodLocality {
        region: get(REGION_LABEL),
        zone: get(ZONE_LABEL),
        subzone: get(SUBZONE_LABEL),
    }
}

/// Pod labels plus the non-empty topology labels of the locality.
pub fn augment_labels(
    locality: &PodLocality,
    pod_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = pod_labels.clone();
    for (key, value) in [
        (REGION_LABEL, &locality.region),
        (ZONE_LABEL, &locality.zone),
        (SUBZONE_LABEL, &locality.subzone),
    ] {
        if !value.is_empty() {
            labels.insert(key.to_string(), value.clone());
        }
    }
    labels
}
