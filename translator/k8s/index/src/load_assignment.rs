//! Per-client load assignments.
//!
//! The endpoints of a backend are the same for every proxy, but their
//! priorities are not: a proxy prefers endpoints close to it. For every
//! connected identity and every backend we produce a load assignment whose
//! locality groups are prioritized relative to that identity.

use crate::unique_clients::UniquelyConnectedClient;
use kgateway_translator_collections::{Collection, Derived, Keyed};
use kgateway_translator_core::{
    endpoints::{EndpointWithMd, EndpointsForBackend, LbEndpoint, PodLocality},
    hash_labels, stable_hasher,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    hash::{Hash, Hasher},
    sync::Arc,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityLbEndpoints {
    /// `None` for endpoints whose pod has no known locality.
    pub locality: Option<PodLocality>,
    pub lb_endpoints: Vec<LbEndpoint>,
    pub priority: u32,
    pub load_balancing_weight: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

/// A load assignment as served to one identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerClientAssignment {
    pub client: String,
    pub assignment: ClusterLoadAssignment,
    /// Changes whenever the assignment does.
    pub fingerprint: u64,
}

/// Failover priority labels, parsed from `label[=value]` entries.
///
/// Without a value, an endpoint matches a label when it carries the same value
/// as the proxy. With a value, the endpoint must carry that value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Priorities {
    labels: Vec<String>,
    overrides: BTreeMap<String, String>,
}

pub type Assignments = Derived<EndpointsForBackend, PerClientAssignment>;

// === impl Priorities ===

impl Priorities {
    /// Returns `None` when no labels are configured.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Option<Self> {
        let mut out = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some((label, value)) => {
                    out.overrides.insert(label.to_string(), value.to_string());
                    out.labels.push(label.to_string());
                }
                None => out.labels.push(entry.to_string()),
            }
        }
        if out.labels.is_empty() {
            return None;
        }
        Some(out)
    }

    /// 0 when every label matches. Otherwise the earlier the first mismatching
    /// label, the larger (lower) the priority.
    pub fn priority(
        &self,
        proxy_labels: &BTreeMap<String, String>,
        ep_labels: &BTreeMap<String, String>,
    ) -> u32 {
        let lowest = self.labels.len() as u32;
        for (j, label) in self.labels.iter().enumerate() {
            let wanted = self
                .overrides
                .get(label)
                .or_else(|| proxy_labels.get(label));
            if wanted != ep_labels.get(label) {
                return lowest - j as u32;
            }
        }
        0
    }
}

// === impl PerClientAssignment ===

impl PerClientAssignment {
    pub fn new(client: &UniquelyConnectedClient, assignment: ClusterLoadAssignment) -> Self {
        let fingerprint = fingerprint(&assignment);
        Self {
            client: client.resource_name().to_string(),
            assignment,
            fingerprint,
        }
    }
}

impl Keyed for PerClientAssignment {
    fn key(&self) -> String {
        format!("{}/{}", self.client, self.assignment.cluster_name)
    }
}

/// Builds the load assignments of every connected identity for every backend.
///
/// Assignments are computed per backend, so a change to one backend's
/// endpoints only recomputes that backend's assignments. A change in the
/// connected identities recomputes every backend.
pub fn assignments<C, E>(
    clients: Arc<C>,
    endpoints: Arc<E>,
    priorities: Option<Priorities>,
) -> Arc<Assignments>
where
    C: Collection<UniquelyConnectedClient> + Send + Sync + ?Sized + 'static,
    E: Collection<EndpointsForBackend> + ?Sized + 'static,
{
    Derived::many("load-assignments", endpoints, move |ctx, ep| {
        let mut clients: Vec<Arc<UniquelyConnectedClient>> = ctx.fetch(&*clients);
        clients.sort_by(|a, b| a.resource_name().cmp(b.resource_name()));
        clients
            .iter()
            .map(|client| {
                PerClientAssignment::new(client, prioritize(client, ep, priorities.as_ref()))
            })
            .collect()
    })
}

/// Groups a backend's endpoints by locality and prioritizes the groups
/// relative to the client.
pub fn prioritize(
    client: &UniquelyConnectedClient,
    ep: &EndpointsForBackend,
    priorities: Option<&Priorities>,
) -> ClusterLoadAssignment {
    let mut endpoints = Vec::new();
    for locality in ep.localities() {
        let eps = match ep.lb_eps.get(locality) {
            Some(eps) if !eps.is_empty() => eps,
            _ => continue,
        };
        let loc = (*locality != PodLocality::default()).then(|| locality.clone());
        match priorities {
            Some(p) => endpoints.extend(by_label_priority(&loc, eps, &client.labels, p)),
            None => endpoints.push(LocalityLbEndpoints {
                locality: loc.clone(),
                lb_endpoints: eps.iter().map(|e| e.endpoint.clone()).collect(),
                priority: lb_priority(&client.locality, loc.as_ref()),
                load_balancing_weight: None,
            }),
        }
    }

    if priorities.is_none() {
        compact(&mut endpoints);
    }

    ClusterLoadAssignment {
        cluster_name: ep.cluster_name.clone(),
        endpoints,
    }
}

/// 0 when region, zone and subzone match; 1 when region and zone match; 2
/// when only the region matches; 3 otherwise.
pub fn lb_priority(proxy: &PodLocality, endpoints: Option<&PodLocality>) -> u32 {
    let empty = PodLocality::default();
    let endpoints = endpoints.unwrap_or(&empty);
    if proxy.region != endpoints.region {
        return 3;
    }
    if proxy.zone != endpoints.zone {
        return 2;
    }
    if proxy.subzone != endpoints.subzone {
        return 1;
    }
    0
}

fn by_label_priority(
    locality: &Option<PodLocality>,
    eps: &[EndpointWithMd],
    proxy_labels: &BTreeMap<String, String>,
    p: &Priorities,
) -> Vec<LocalityLbEndpoints> {
    let mut groups = BTreeMap::<u32, Vec<&EndpointWithMd>>::new();
    for ep in eps {
        groups
            .entry(p.priority(proxy_labels, &ep.md.labels))
            .or_default()
            .push(ep);
    }

    groups
        .into_iter()
        .map(|(priority, eps)| {
            // Endpoints without an explicit weight count once.
            let weight = eps
                .iter()
                .map(|e| e.endpoint.load_balancing_weight.unwrap_or(1))
                .sum();
            LocalityLbEndpoints {
                locality: locality.clone(),
                lb_endpoints: eps.into_iter().map(|e| e.endpoint.clone()).collect(),
                priority,
                load_balancing_weight: Some(weight),
            }
        })
        .collect()
}

/// Renumbers priorities to 0..N without gaps, keeping their order.
fn compact(endpoints: &mut [LocalityLbEndpoints]) {
    let used = endpoints
        .iter()
        .map(|e| e.priority)
        .collect::<BTreeSet<_>>();
    let rank = used
        .into_iter()
        .enumerate()
        .map(|(i, p)| (p, i as u32))
        .collect::<BTreeMap<_, _>>();
    for ep in endpoints {
        if let Some(r) = rank.get(&ep.priority) {
            ep.priority = *r;
        }
    }
}

fn fingerprint(cla: &ClusterLoadAssignment) -> u64 {
    let mut h = stable_hasher();
    cla.cluster_name.hash(&mut h);
    for group in &cla.endpoints {
        group.locality.hash(&mut h);
        group.priority.hash(&mut h);
        group.load_balancing_weight.hash(&mut h);
        for ep in &group.lb_endpoints {
            ep.address.hash(&mut h);
            ep.port.hash(&mut h);
            ep.load_balancing_weight.hash(&mut h);
            for (filter, md) in &ep.metadata {
                filter.hash(&mut h);
                hash_labels(md).hash(&mut h);
            }
        }
    }
    h.finish()
}
