//! Tracks the distinct proxy identities connected to the xDS server.
//!
//! Proxies in different localities, or with different labels, may need
//! different configuration (e.g. endpoint priorities). Every stream is mapped
//! to an identity derived from the proxy's pod; downstream translation runs
//! once per identity rather than once per stream.

use crate::{metrics::IndexMetrics, pods::LocalityPods};
use ahash::AHashMap as HashMap;
use kgateway_translator_collections::{Collection, Derived, Keyed, RecomputeTrigger};
use kgateway_translator_core::{endpoints::PodLocality, hash_labels, KEY_DELIMITER};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

/// Roles of proxies managed through Gateway API resources carry this prefix.
pub const KUBE_GATEWAY_ROLE_PREFIX: &str = "kgateway-kube-gateway-api~";

/// The node metadata key holding the proxy's role.
pub const ROLE_KEY: &str = "role";

/// The parts of an xDS node that identify a proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// `<pod name>.<pod namespace>`.
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniquelyConnectedClient {
    pub role: String,
    pub labels: BTreeMap<String, String>,
    pub locality: PodLocality,
    pub namespace: String,
    /// The role, qualified by the label hash and namespace. Proxies are
    /// served the snapshot stored under this name.
    resource_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("pod not found for node {0}")]
    PodNotFound(String),
}

/// Receives xDS stream callbacks and maintains the set of connected
/// identities.
pub struct UniqueClients {
    pods: Option<Arc<LocalityPods>>,
    require_pod_locality: bool,
    state: RwLock<State>,
    trigger: RecomputeTrigger,
    metrics: OnceLock<IndexMetrics>,
}

#[derive(Default)]
struct State {
    /// The identity each open stream resolved to.
    streams: HashMap<i64, String>,
    counts: HashMap<String, u64>,
    clients: HashMap<String, UniquelyConnectedClient>,
}

// === impl UniquelyConnectedClient ===

impl UniquelyConnectedClient {
    /// Without a namespace the client has no pod information and its role is
    /// used as is.
    pub fn new(
        role: impl Into<String>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
        locality: PodLocality,
    ) -> Self {
        let role = role.into();
        let namespace = namespace.into();
        let resource_name = if namespace.is_empty() {
            role.clone()
        } else {
            format!(
                "{role}{KEY_DELIMITER}{}{KEY_DELIMITER}{namespace}",
                hash_labels(&labels)
            )
        };
        Self {
            role,
            labels,
            locality,
            namespace,
            resource_name,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

impl Keyed for UniquelyConnectedClient {
    fn key(&self) -> String {
        self.resource_name.clone()
    }
}

// === impl UniqueClients ===

impl UniqueClients {
    /// Without a pod collection, identities carry no locality and all
    /// proxies of a role share one identity.
    pub fn new(pods: Option<Arc<LocalityPods>>, require_pod_locality: bool) -> Arc<Self> {
        Arc::new(Self {
            pods,
            require_pod_locality,
            state: RwLock::new(State::default()),
            trigger: RecomputeTrigger::new("unique-clients", true),
            metrics: OnceLock::new(),
        })
    }

    pub fn with_metrics(self: Arc<Self>, metrics: &IndexMetrics) -> Arc<Self> {
        if self.metrics.set(metrics.clone()).is_ok() {
            self.observe(&self.state.read());
        }
        self
    }

    /// The connected identities as a collection.
    pub fn collection(self: &Arc<Self>) -> Arc<Derived<(), UniquelyConnectedClient>> {
        let this = self.clone();
        Derived::many_from_nothing("unique-clients", move |ctx| {
            this.trigger.mark_dependency(ctx);
            this.clients()
        })
    }

    /// Connected identities, ordered by resource name.
    pub fn clients(&self) -> Vec<UniquelyConnectedClient> {
        let state = self.state.read();
        let mut clients = state.clients.values().cloned().collect::<Vec<_>>();
        clients.sort_by(|a, b| a.resource_name.cmp(&b.resource_name));
        clients
    }

    pub fn get(&self, resource_name: &str) -> Option<UniquelyConnectedClient> {
        self.state.read().clients.get(resource_name).cloned()
    }

    pub fn on_stream_open(&self, stream_id: i64, type_url: &str) -> Result<(), ClientError> {
        tracing::trace!(stream_id, type_url, "Stream opened");
        Ok(())
    }

    /// Registers the stream's identity on its first request and rewrites the
    /// node's role to the identity's resource name.
    pub fn on_stream_request(&self, stream_id: i64, node: &mut Node) -> Result<(), ClientError> {
        let Some(role) = kube_gateway_role(node) else {
            return Ok(());
        };

        let known = self.state.read().streams.get(&stream_id).cloned();
        let resource_name = match known {
            Some(name) => name,
            None => {
                let client = self.identify(&role, node).inspect_err(|_| {
                    if let Some(m) = self.metrics.get() {
                        m.inc_client_errors();
                    }
                })?;
                let name = client.resource_name.clone();
                if self.add(stream_id, client) {
                    self.trigger.trigger_recomputation();
                }
                name
            }
        };
        node.metadata.insert(ROLE_KEY.to_string(), resource_name);
        Ok(())
    }

    pub fn on_stream_closed(&self, stream_id: i64) {
        if let Some(client) = self.remove(stream_id) {
            tracing::debug!(client = %client.resource_name, "Last stream closed");
            self.trigger.trigger_recomputation();
        }
    }

    /// Fetch requests are stateless: the role is rewritten but nothing is
    /// tracked.
    pub fn on_fetch_request(&self, node: &mut Node) -> Result<(), ClientError> {
        let Some(role) = kube_gateway_role(node) else {
            return Ok(());
        };
        let client = self.identify(&role, node)?;
        node.metadata
            .insert(ROLE_KEY.to_string(), client.resource_name);
        Ok(())
    }

    fn identify(&self, role: &str, node: &Node) -> Result<UniquelyConnectedClient, ClientError> {
        let Some(pods) = &self.pods else {
            return Ok(UniquelyConnectedClient::new(
                role,
                "",
                BTreeMap::new(),
                PodLocality::default(),
            ));
        };

        let pod = pod_key(&node.id).and_then(|key| pods.get(&key));
        match pod {
            Some(pod) => {
                tracing::debug!(
                    node = %node.id,
                    namespace = %pod.namespace,
                    locality = ?pod.locality,
                    "Adding xDS client"
                );
                Ok(UniquelyConnectedClient::new(
                    role,
                    pod.namespace.clone(),
                    pod.augmented_labels.clone(),
                    pod.locality.clone(),
                ))
            }
            None if self.require_pod_locality => {
                tracing::debug!(node = %node.id, "No pod found for xDS client");
                Err(ClientError::PodNotFound(node.id.clone()))
            }
            None => Ok(UniquelyConnectedClient::new(
                role,
                "",
                BTreeMap::new(),
                PodLocality::default(),
            )),
        }
    }

    /// Returns true if the client is a new identity.
    fn add(&self, stream_id: i64, client: UniquelyConnectedClient) -> bool {
        let mut state = self.state.write();
        if state.streams.contains_key(&stream_id) {
            return false;
        }
        let name = client.resource_name.clone();
        state.streams.insert(stream_id, name.clone());
        let count = state.counts.entry(name.clone()).or_default();
        *count += 1;
        let new = *count == 1;
        if new {
            state.clients.insert(name, client);
        }
        self.observe(&state);
        new
    }

    /// Returns the client if the stream was the last one for its identity.
    fn remove(&self, stream_id: i64) -> Option<UniquelyConnectedClient> {
        let mut state = self.state.write();
        let name = state.streams.remove(&stream_id)?;
        let count = state.counts.get_mut(&name)?;
        *count -= 1;
        let removed = if *count == 0 {
            state.counts.remove(&name);
            state.clients.remove(&name)
        } else {
            None
        };
        self.observe(&state);
        removed
    }

    fn observe(&self, state: &State) {
        if let Some(m) = self.metrics.get() {
            m.set_clients(state.clients.len(), state.streams.len());
        }
    }
}

fn kube_gateway_role(node: &Node) -> Option<String> {
    node.metadata
        .get(ROLE_KEY)
        .filter(|role| role.starts_with(KUBE_GATEWAY_ROLE_PREFIX))
        .cloned()
}

/// Node IDs are `<name>.<namespace>`; pods are keyed `<namespace>/<name>`.
fn pod_key(node_id: &str) -> Option<String> {
    let (name, namespace) = node_id.split_once('.')?;
    Some(format!("{namespace}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pods::locality_pods,
        tests::{init_tracing, mk_node, mk_pod},
    };
    use kgateway_translator_collections::{Collection, StaticCollection};
    use kgateway_translator_k8s_api::{Node as K8sNode, Pod};
    use maplit::btreemap;

    const ROLE: &str = "kgateway-kube-gateway-api~default~gw";

    struct Fixture {
        pods: Arc<StaticCollection<Pod>>,
        clients: Arc<UniqueClients>,
        collection: Arc<Derived<(), UniquelyConnectedClient>>,
        metrics: IndexMetrics,
    }

    fn mk_fixture(require_pod_locality: bool) -> Fixture {
        init_tracing();
        let pods = StaticCollection::for_resource("pods").shared();
        let nodes = StaticCollection::<K8sNode>::for_resource("nodes").shared();
        nodes.apply(mk_node(
            "node-a",
            btreemap! {
                "topology.kubernetes.io/region" => "us-east",
                "topology.kubernetes.io/zone" => "us-east-1a",
            },
        ));
        let metrics = IndexMetrics::register(&mut Default::default());
        let clients = UniqueClients::new(Some(locality_pods(pods.clone(), nodes)), require_pod_locality)
            .with_metrics(&metrics);
        let collection = clients.collection();
        Fixture {
            pods,
            clients,
            collection,
            metrics,
        }
    }

    fn mk_xds_node(id: &str, role: &str) -> Node {
        Node {
            id: id.to_string(),
            metadata: [(ROLE_KEY.to_string(), role.to_string())].into_iter().collect(),
        }
    }

    fn gw_pod(name: &str, version: &str) -> Pod {
        mk_pod(
            "default",
            name,
            "node-a",
            "10.0.0.1",
            btreemap! { "app" => "gw", "version" => version },
        )
    }

    #[test]
    fn identities_are_reference_counted_across_streams() {
        let f = mk_fixture(true);
        f.pods.apply(gw_pod("gw-1", "v1"));
        f.pods.apply(gw_pod("gw-2", "v1"));

        let start = f.clients.trigger.generation();
        for (stream, pod) in [(1, "gw-1"), (2, "gw-1"), (3, "gw-2")] {
            let mut node = mk_xds_node(&format!("{pod}.default"), ROLE);
            f.clients.on_stream_request(stream, &mut node).unwrap();
        }
        assert_eq!(f.clients.trigger.generation(), start + 1, "one identity was added");
        assert_eq!(f.collection.list().len(), 1);
        assert_eq!(f.metrics.connected_clients(), 1);

        // Repeated requests on a known stream change nothing.
        let mut node = mk_xds_node("gw-1.default", ROLE);
        f.clients.on_stream_request(1, &mut node).unwrap();
        assert_eq!(f.clients.trigger.generation(), start + 1);

        f.clients.on_stream_closed(1);
        f.clients.on_stream_closed(3);
        assert_eq!(f.collection.list().len(), 1);
        assert_eq!(f.clients.trigger.generation(), start + 1);

        f.clients.on_stream_closed(2);
        assert!(f.collection.list().is_empty());
        assert_eq!(f.clients.trigger.generation(), start + 2, "one identity was removed");
        assert_eq!(f.metrics.connected_clients(), 0);

        // Closing an unknown stream is a no-op.
        f.clients.on_stream_closed(2);
        assert_eq!(f.clients.trigger.generation(), start + 2);
    }

    #[test]
    fn roles_are_rewritten_to_the_identity() {
        let f = mk_fixture(true);
        f.pods.apply(gw_pod("gw-1", "v1"));
        f.pods.apply(gw_pod("gw-2", "v2"));

        let mut a = mk_xds_node("gw-1.default", ROLE);
        let mut b = mk_xds_node("gw-2.default", ROLE);
        f.clients.on_stream_request(1, &mut a).unwrap();
        f.clients.on_stream_request(2, &mut b).unwrap();

        let a_name = &a.metadata[ROLE_KEY];
        assert!(a_name.starts_with(&format!("{ROLE}~")), "{a_name}");
        assert!(a_name.ends_with("~default"), "{a_name}");
        assert_ne!(a_name, &b.metadata[ROLE_KEY], "labels distinguish identities");

        let clients = f.collection.list();
        assert_eq!(clients.len(), 2);
        let client = f.clients.get(a_name).unwrap();
        assert_eq!(client.locality.zone, "us-east-1a");
        assert_eq!(client.labels["topology.kubernetes.io/region"], "us-east");
        assert_eq!(client.labels["version"], "v1");
    }

    #[test]
    fn other_roles_are_ignored() {
        let f = mk_fixture(true);
        let mut node = mk_xds_node("gw-1.default", "gloo-system~gateway-proxy");
        f.clients.on_stream_request(1, &mut node).unwrap();
        assert_eq!(node.metadata[ROLE_KEY], "gloo-system~gateway-proxy");
        assert!(f.clients.clients().is_empty());
    }

    #[test]
    fn missing_pods() {
        let f = mk_fixture(true);
        let mut node = mk_xds_node("missing.default", ROLE);
        assert_eq!(
            f.clients.on_stream_request(1, &mut node),
            Err(ClientError::PodNotFound("missing.default".to_string()))
        );
        assert!(f.clients.clients().is_empty());

        let f = mk_fixture(false);
        let mut node = mk_xds_node("missing.default", ROLE);
        f.clients.on_stream_request(1, &mut node).unwrap();
        assert_eq!(node.metadata[ROLE_KEY], ROLE, "falls back to the bare role");
    }

    #[test]
    fn fetch_requests_are_not_tracked() {
        let f = mk_fixture(true);
        f.pods.apply(gw_pod("gw-1", "v1"));
        let mut node = mk_xds_node("gw-1.default", ROLE);
        f.clients.on_fetch_request(&mut node).unwrap();
        assert_ne!(node.metadata[ROLE_KEY], ROLE);
        assert!(f.clients.clients().is_empty());
    }

    #[test]
    fn without_pods_all_proxies_of_a_role_share_an_identity() {
        let clients = UniqueClients::new(None, true);
        let mut a = mk_xds_node("gw-1.default", ROLE);
        let mut b = mk_xds_node("gw-2.default", ROLE);
        clients.on_stream_request(1, &mut a).unwrap();
        clients.on_stream_request(2, &mut b).unwrap();
        assert_eq!(a.metadata[ROLE_KEY], ROLE);
        assert_eq!(clients.clients().len(), 1);
    }
}
