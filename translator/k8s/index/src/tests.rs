//! Object builders shared by the index tests.

use crate::{
    backends::{service_backends, BackendIndex},
    endpoints::SERVICE_NAME_LABEL,
    policies::PolicyIndex,
    query::GatewayQueries,
    refgrants::ReferenceGrants,
    routes::{RouteInputs, RoutesIndex},
};
use k8s_openapi::{
    api::core::v1::{NodeSpec, ObjectReference, PodIP},
    ByteString,
};
use kgateway_translator_k8s_api::{
    gateway_api::{self as api},
    Endpoint, EndpointConditions, EndpointPort, EndpointSlice, Namespace, Node, ObjectMeta, Pod,
    PodSpec, PodStatus, Secret, Service, ServicePort, ServiceSpec, Time,
};
use kgateway_translator_collections::StaticCollection;
use kgateway_translator_core::GroupKind;
use std::{collections::BTreeMap, sync::Arc};

pub(crate) fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .ok();
}

fn labels(labels: BTreeMap<&str, &str>) -> Option<BTreeMap<String, String>> {
    Some(
        labels
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub(crate) fn created_at(secs: i64) -> Option<Time> {
    chrono::DateTime::from_timestamp(secs, 0).map(Time)
}

pub(crate) fn mk_namespace(name: &str, ns_labels: BTreeMap<&str, &str>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: labels(ns_labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn mk_node(name: &str, node_labels: BTreeMap<&str, &str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: labels(node_labels),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        ..Default::default()
    }
}

pub(crate) fn mk_pod(
    ns: &str,
    name: &str,
    node: &str,
    ip: &str,
    pod_labels: BTreeMap<&str, &str>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            labels: labels(pod_labels),
            ..meta(ns, name)
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            pod_ips: Some(vec![PodIP { ip: ip.to_string() }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn mk_service(ns: &str, name: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            resource_version: Some("1".to_string()),
            ..meta(ns, name)
        },
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| ServicePort {
                        name: Some(name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SliceEndpoint {
    pub address: &'static str,
    pub ready: Option<bool>,
    pub pod: Option<&'static str>,
}

impl SliceEndpoint {
    pub fn ready(address: &'static str) -> Self {
        Self {
            address,
            ready: Some(true),
            pod: None,
        }
    }
}

pub(crate) fn mk_slice(
    ns: &str,
    name: &str,
    service: &str,
    ports: &[(Option<&str>, i32)],
    endpoints: Vec<SliceEndpoint>,
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            labels: labels([(SERVICE_NAME_LABEL, service)].into_iter().collect()),
            ..meta(ns, name)
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .into_iter()
            .map(|ep| Endpoint {
                addresses: vec![ep.address.to_string()],
                conditions: Some(EndpointConditions {
                    ready: ep.ready,
                    ..Default::default()
                }),
                target_ref: ep.pod.map(|pod| ObjectReference {
                    kind: Some("Pod".to_string()),
                    namespace: Some(ns.to_string()),
                    name: Some(pod.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(
            ports
                .iter()
                .map(|(name, port)| EndpointPort {
                    name: name.map(Into::into),
                    port: Some(*port),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

pub(crate) fn mk_refgrant(
    ns: &str,
    name: &str,
    (from_group, from_kind, from_ns): (&str, &str, &str),
    (to_group, to_kind, to_name): (&str, &str, Option<&str>),
) -> api::ReferenceGrant {
    api::ReferenceGrant {
        metadata: meta(ns, name),
        spec: api::ReferenceGrantSpec {
            from: vec![api::ReferenceGrantFrom {
                group: from_group.to_string(),
                kind: from_kind.to_string(),
                namespace: from_ns.to_string(),
            }],
            to: vec![api::ReferenceGrantTo {
                group: to_group.to_string(),
                kind: to_kind.to_string(),
                name: to_name.map(Into::into),
            }],
        },
    }
}

pub(crate) fn mk_gateway_class(name: &str, controller: &str) -> api::GatewayClass {
    api::GatewayClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: api::GatewayClassSpec {
            controller_name: controller.to_string(),
            description: None,
        },
        status: None,
    }
}

/// Listeners are given in their JSON form.
pub(crate) fn mk_gateway(
    ns: &str,
    name: &str,
    class: &str,
    listeners: serde_json::Value,
) -> api::Gateway {
    api::Gateway {
        metadata: ObjectMeta {
            generation: Some(1),
            ..meta(ns, name)
        },
        spec: api::GatewaySpec {
            gateway_class_name: class.to_string(),
            listeners: serde_json::from_value(listeners).expect("listeners must be valid"),
        },
        status: None,
    }
}

/// Parents are written `gw`, `ns/gw`, or `HTTPRoute:ns/name`.
fn parent_refs(parents: &[&str]) -> Option<Vec<api::ParentReference>> {
    let refs = parents
        .iter()
        .map(|p| {
            let (kind, p) = match p.strip_prefix("HTTPRoute:") {
                Some(p) => (Some("HTTPRoute".to_string()), p),
                None => (None, *p),
            };
            let (namespace, name) = match p.split_once('/') {
                Some((ns, name)) => (Some(ns.to_string()), name),
                None => (None, p),
            };
            api::ParentReference {
                group: kind.as_ref().map(|_| api::GROUP.to_string()),
                kind,
                namespace,
                name: name.to_string(),
                section_name: None,
                port: None,
            }
        })
        .collect();
    Some(refs)
}

/// Rules are given in their JSON form.
pub(crate) fn mk_http_route(
    ns: &str,
    name: &str,
    parents: &[&str],
    rules: serde_json::Value,
) -> api::HttpRoute {
    api::HttpRoute {
        metadata: ObjectMeta {
            generation: Some(1),
            ..meta(ns, name)
        },
        spec: api::HttpRouteSpec {
            parent_refs: parent_refs(parents),
            hostnames: None,
            rules: Some(serde_json::from_value(rules).expect("rules must be valid")),
        },
        status: None,
    }
}

pub(crate) fn mk_tcp_route(
    ns: &str,
    name: &str,
    parents: &[&str],
    backends: &[(&str, i32)],
) -> api::TcpRoute {
    api::TcpRoute {
        metadata: ObjectMeta {
            generation: Some(1),
            ..meta(ns, name)
        },
        spec: api::TcpRouteSpec {
            parent_refs: parent_refs(parents),
            rules: vec![api::TcpRouteRule {
                backend_refs: backends
                    .iter()
                    .map(|(name, port)| api::BackendRef {
                        inner: api::BackendObjectReference {
                            name: name.to_string(),
                            port: Some(*port),
                            ..Default::default()
                        },
                        weight: None,
                    })
                    .collect(),
            }],
        },
        status: None,
    }
}

pub(crate) fn mk_tls_secret(ns: &str, name: &str, cert: &str, key: &str) -> Secret {
    Secret {
        metadata: meta(ns, name),
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), ByteString(cert.as_bytes().to_vec())),
            ("tls.key".to_string(), ByteString(key.as_bytes().to_vec())),
        ])),
        ..Default::default()
    }
}

/// A self-signed certificate and its private key, PEM encoded.
pub(crate) fn mk_cert(host: &str) -> (String, String) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![host.to_string()]).expect("certificate");
    (cert.pem(), key_pair.serialize_pem())
}

/// Route, namespace, and secret inputs wired into [`GatewayQueries`].
pub(crate) struct QueryFixture {
    pub services: Arc<StaticCollection<Service>>,
    pub grants: Arc<StaticCollection<api::ReferenceGrant>>,
    pub namespaces: Arc<StaticCollection<Namespace>>,
    pub secrets: Arc<StaticCollection<Secret>>,
    pub routes: RouteInputs,
    pub queries: Arc<GatewayQueries>,
}

pub(crate) fn mk_queries() -> QueryFixture {
    let services = StaticCollection::for_resource("services").shared();
    let grants = StaticCollection::for_resource("grants").shared();
    let refgrants = Arc::new(ReferenceGrants::new(grants.clone()));
    let mut backends = BackendIndex::new(refgrants.clone());
    backends.register(GroupKind::service(), service_backends(services.clone()));
    let routes = RouteInputs {
        http_routes: StaticCollection::for_resource("http-routes").shared(),
        tcp_routes: StaticCollection::for_resource("tcp-routes").shared(),
        tls_routes: StaticCollection::for_resource("tls-routes").shared(),
    };
    let index = Arc::new(RoutesIndex::new(
        routes.clone(),
        Arc::new(backends),
        Arc::new(PolicyIndex::new(vec![])),
    ));
    let namespaces = StaticCollection::for_resource("namespaces").shared();
    let secrets = StaticCollection::for_resource("secrets").shared();
    let queries = Arc::new(GatewayQueries::new(
        index,
        namespaces.clone(),
        secrets.clone(),
        refgrants,
    ));
    QueryFixture {
        services,
        grants,
        namespaces,
        secrets,
        routes,
        queries,
    }
}

#[test]
fn index_serves_gateways_and_connected_clients() {
    use crate::{
        load_assignment::Priorities,
        unique_clients::{Node as XdsNode, ROLE_KEY},
        Index, IndexMetrics, Inputs, Settings,
    };
    use kgateway_translator_collections::{metrics::CollectionMetrics, Collection};
    use kgateway_translator_core::{plugin::PluginRegistry, GATEWAY_CONTROLLER_NAME};
    use maplit::btreemap;

    init_tracing();
    let mut prom = prometheus_client::registry::Registry::default();
    let collection_metrics = CollectionMetrics::register(&mut prom);
    let inputs = Inputs::new(&collection_metrics);
    let index = Index::new(
        &inputs,
        Settings {
            controller_name: GATEWAY_CONTROLLER_NAME.to_string(),
            enable_auto_mtls: false,
            require_pod_locality: true,
            failover_priority: Priorities::parse::<&str>(&[]),
        },
        PluginRegistry::with_builtins(),
        vec![],
        &collection_metrics,
        IndexMetrics::register(&mut prom),
    );

    inputs.nodes.apply(mk_node(
        "node-a",
        btreemap! {
            "topology.kubernetes.io/region" => "r1",
            "topology.kubernetes.io/zone" => "z1",
        },
    ));
    inputs
        .pods
        .apply(mk_pod("default", "web-1", "node-a", "10.0.0.10", btreemap! { "app" => "web" }));
    inputs
        .pods
        .apply(mk_pod("default", "gw-1", "node-a", "10.0.0.20", btreemap! { "app" => "gw" }));
    inputs
        .services
        .apply(mk_service("default", "web", &[("http", 8080)]));
    inputs.endpoint_slices.apply(mk_slice(
        "default",
        "web-abc",
        "web",
        &[(Some("http"), 8080)],
        vec![SliceEndpoint {
            address: "10.0.0.10",
            ready: Some(true),
            pod: Some("web-1"),
        }],
    ));
    inputs
        .gateway_classes
        .apply(mk_gateway_class("kgateway", GATEWAY_CONTROLLER_NAME));
    inputs.gateways.apply(mk_gateway(
        "default",
        "gw",
        "kgateway",
        serde_json::json!([{ "name": "http", "port": 80, "protocol": "HTTP" }]),
    ));
    inputs.http_routes.apply(mk_http_route(
        "default",
        "web",
        &["gw"],
        serde_json::json!([{ "backendRefs": [{ "name": "web", "port": 8080 }] }]),
    ));

    let snapshot = index
        .snapshots
        .get("default/gw")
        .expect("gateway must be translated");
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.clusters.len(), 1);
    assert_eq!(snapshot.clusters[0].name, "kube_default_web_8080");

    let mut node = XdsNode {
        id: "gw-1.default".to_string(),
        metadata: btreemap! {
            ROLE_KEY.to_string() => "kgateway-kube-gateway-api~default~gw".to_string(),
        },
    };
    index
        .clients
        .on_stream_request(1, &mut node)
        .expect("gateway pod is known");
    let key = format!("{}/kube_default_web_8080", node.metadata[ROLE_KEY]);
    let assignment = index
        .assignments
        .get(&key)
        .expect("connected client must get an assignment");
    let group = &assignment.assignment.endpoints[0];
    assert_eq!(group.priority, 0);
    assert_eq!(group.lb_endpoints[0].address, "10.0.0.10");

    index.clients.on_stream_closed(1);
    assert!(index.assignments.get(&key).is_none());
}
