use crate::{backend::backend_resource_name, hash_labels, stable_hasher, ObjectSource};
use ahash::AHashMap as HashMap;
use kgateway_translator_collections::Keyed;
use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodLocality {
    pub region: String,
    pub zone: String,
    pub subzone: String,
}

/// Filter metadata, keyed by filter name.
pub type FilterMetadata = BTreeMap<String, BTreeMap<String, String>>;

/// The proxy-facing description of a single endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LbEndpoint {
    pub address: String,
    pub port: u32,
    pub load_balancing_weight: Option<u32>,
    pub metadata: FilterMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointMetadata {
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointWithMd {
    pub endpoint: LbEndpoint,
    pub md: EndpointMetadata,
}

/// The endpoints of a backend, partitioned by locality.
///
/// Equality is decided by a fingerprint over (locality, endpoint, labels)
/// membership that is accumulated as endpoints are added. The fingerprint does
/// not depend on the order endpoints were added in, nor on which backend owns
/// the set.
#[derive(Clone, Debug)]
pub struct EndpointsForBackend {
    pub lb_eps: HashMap<PodLocality, Vec<EndpointWithMd>>,
    pub cluster_name: String,
    pub backend: ObjectSource,
    pub port: u16,
    equality_hash: u64,
}

// === impl EndpointsForBackend ===

impl EndpointsForBackend {
    pub fn new(backend: ObjectSource, port: u16, cluster_name: impl Into<String>) -> Self {
        Self {
            lb_eps: HashMap::default(),
            cluster_name: cluster_name.into(),
            backend,
            port,
            equality_hash: 0,
        }
    }

    pub fn add(&mut self, locality: PodLocality, ep: EndpointWithMd) {
        let mut h = stable_hasher();
        locality.region.hash(&mut h);
        locality.zone.hash(&mut h);
        locality.subzone.hash(&mut h);
        ep.endpoint.address.hash(&mut h);
        ep.endpoint.port.hash(&mut h);
        hash_labels(&ep.md.labels).hash(&mut h);
        ep.endpoint.metadata.hash(&mut h);
        ep.endpoint.load_balancing_weight.hash(&mut h);
        self.equality_hash ^= h.finish();

        self.lb_eps.entry(locality).or_default().push(ep);
    }

    pub fn equality_hash(&self) -> u64 {
        self.equality_hash
    }

    pub fn is_empty(&self) -> bool {
        self.lb_eps.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.lb_eps.values().map(Vec::len).sum()
    }

    /// Localities in a deterministic order.
    pub fn localities(&self) -> Vec<&PodLocality> {
        let mut locs = self.lb_eps.keys().collect::<Vec<_>>();
        locs.sort();
        locs
    }
}

impl Keyed for EndpointsForBackend {
    /// Endpoints are stored under the key of the backend they belong to.
    fn key(&self) -> String {
        backend_resource_name(&self.backend, self.port)
    }
}

impl PartialEq for EndpointsForBackend {
    fn eq(&self, other: &Self) -> bool {
        self.equality_hash == other.equality_hash
    }
}
