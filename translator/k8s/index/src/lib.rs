//! Gateway API translation indices
//!
//! Every watched resource kind is held in a [`StaticCollection`]. The indices
//! in this crate are derived collections over them:
//!
//! ```text
//! [ Pod ] + [ Node ] -> [ LocalityPod ] ----------------------+
//!                                                              v
//! [ Service ] -> [ Backend ] ---------------------------> [ Endpoints ] <- [ EndpointSlice ]
//!                    |                                         |
//!                    v                                         v
//! [ *Route ] -> [ RouteIr ] <- [ Policy ]       [ Client ] -> [ LoadAssignment ]
//!                    |
//!                    v
//! [ Gateway ] -> [ GatewaySnapshot ] <- [ GatewayClass ], [ Namespace ], [ Secret ], [ ReferenceGrant ]
//! ```
//!
//! A [`GatewaySnapshot`] holds everything the proxies of one Gateway are
//! configured with, along with the status reports of the Gateway and of the
//! routes attached to it. Snapshots are recomputed only when a resource they
//! read changes.
//!
//! Load assignments are computed per connected proxy identity rather than
//! per Gateway, so that endpoints may be prioritized by locality.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backends;
pub mod delegation;
pub mod endpoints;
pub mod listeners;
pub mod load_assignment;
pub mod metrics;
pub mod pods;
pub mod policies;
pub mod query;
pub mod refgrants;
pub mod routes;
pub mod translator;
pub mod unique_clients;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::IndexMetrics,
    translator::{GatewaySnapshot, GatewayTranslator},
    unique_clients::{UniqueClients, UniquelyConnectedClient},
};
use self::{
    backends::{service_backends, BackendIndex},
    endpoints::{backend_endpoints, BackendEndpoints, EndpointsInputs},
    load_assignment::{assignments, Assignments, Priorities},
    pods::{locality_pods, LocalityPods},
    policies::{PolicyIndex, PolicyWrapper},
    query::GatewayQueries,
    refgrants::ReferenceGrants,
    routes::{RouteInputs, RoutesIndex},
};
use kgateway_translator_collections::{
    metrics::CollectionMetrics, Collection, Derived, Source, StaticCollection, Synced,
};
use kgateway_translator_core::{backend::BackendObjectIr, plugin::PluginRegistry, GroupKind};
use kgateway_translator_k8s_api::{
    gateway_api as api, EndpointSlice, Namespace, Node, Pod, Secret, Service,
};
use std::sync::Arc;

/// Translation settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub controller_name: String,
    /// Adds transport socket match metadata to endpoints of mesh workloads.
    pub enable_auto_mtls: bool,
    /// When set, a proxy whose pod can't be found fails its stream.
    pub require_pod_locality: bool,
    pub failover_priority: Option<Priorities>,
}

/// The watched resources.
#[derive(Clone)]
pub struct Inputs {
    pub gateway_classes: Arc<StaticCollection<api::GatewayClass>>,
    pub gateways: Arc<StaticCollection<api::Gateway>>,
    pub http_routes: Arc<StaticCollection<api::HttpRoute>>,
    pub tcp_routes: Arc<StaticCollection<api::TcpRoute>>,
    pub tls_routes: Arc<StaticCollection<api::TlsRoute>>,
    pub reference_grants: Arc<StaticCollection<api::ReferenceGrant>>,
    pub namespaces: Arc<StaticCollection<Namespace>>,
    pub services: Arc<StaticCollection<Service>>,
    pub endpoint_slices: Arc<StaticCollection<EndpointSlice>>,
    pub secrets: Arc<StaticCollection<Secret>>,
    pub pods: Arc<StaticCollection<Pod>>,
    pub nodes: Arc<StaticCollection<Node>>,
}

/// The derived collections, wired together.
pub struct Index {
    pub pods: Arc<LocalityPods>,
    pub service_backends: Arc<Derived<Service, BackendObjectIr>>,
    pub endpoints: Arc<BackendEndpoints>,
    pub policies: Arc<PolicyIndex>,
    pub routes: Arc<RoutesIndex>,
    pub snapshots: Arc<Derived<api::Gateway, GatewaySnapshot>>,
    pub clients: Arc<UniqueClients>,
    pub assignments: Arc<Assignments>,
}

// === impl Inputs ===

impl Inputs {
    pub fn new(metrics: &CollectionMetrics) -> Self {
        Self {
            gateway_classes: StaticCollection::for_resource("gateway-classes")
                .shared()
                .with_metrics(metrics),
            gateways: StaticCollection::for_resource("gateways")
                .shared()
                .with_metrics(metrics),
            http_routes: StaticCollection::for_resource("http-routes")
                .shared()
                .with_metrics(metrics),
            tcp_routes: StaticCollection::for_resource("tcp-routes")
                .shared()
                .with_metrics(metrics),
            tls_routes: StaticCollection::for_resource("tls-routes")
                .shared()
                .with_metrics(metrics),
            reference_grants: StaticCollection::for_resource("reference-grants")
                .shared()
                .with_metrics(metrics),
            namespaces: StaticCollection::for_resource("namespaces")
                .shared()
                .with_metrics(metrics),
            services: StaticCollection::for_resource("services")
                .shared()
                .with_metrics(metrics),
            endpoint_slices: StaticCollection::for_resource("endpoint-slices")
                .shared()
                .with_metrics(metrics),
            secrets: StaticCollection::for_resource("secrets")
                .shared()
                .with_metrics(metrics),
            pods: StaticCollection::for_resource("pods")
                .shared()
                .with_metrics(metrics),
            nodes: StaticCollection::for_resource("nodes")
                .shared()
                .with_metrics(metrics),
        }
    }

    /// Synced signals of every input.
    pub fn synced(&self) -> Vec<Synced> {
        vec![
            self.gateway_classes.synced().clone(),
            self.gateways.synced().clone(),
            self.http_routes.synced().clone(),
            self.tcp_routes.synced().clone(),
            self.tls_routes.synced().clone(),
            self.reference_grants.synced().clone(),
            self.namespaces.synced().clone(),
            self.services.synced().clone(),
            self.endpoint_slices.synced().clone(),
            self.secrets.synced().clone(),
            self.pods.synced().clone(),
            self.nodes.synced().clone(),
        ]
    }
}

// === impl Index ===

impl Index {
    /// Wires the derived collections over `inputs`. Plugins contribute policy
    /// collections and the capabilities that apply them.
    pub fn new(
        inputs: &Inputs,
        settings: Settings,
        plugins: PluginRegistry,
        policy_sources: Vec<Arc<dyn Collection<PolicyWrapper>>>,
        collection_metrics: &CollectionMetrics,
        metrics: IndexMetrics,
    ) -> Self {
        let refgrants = Arc::new(ReferenceGrants::new(inputs.reference_grants.clone()));

        let pods = locality_pods(inputs.pods.clone(), inputs.nodes.clone())
            .with_metrics(collection_metrics);
        let service_backends =
            service_backends(inputs.services.clone()).with_metrics(collection_metrics);

        let mut backends = BackendIndex::new(refgrants.clone());
        backends.register(GroupKind::service(), service_backends.clone());
        let backends = Arc::new(backends);

        let endpoints = backend_endpoints(EndpointsInputs {
            backends: service_backends.clone(),
            endpoint_slices: inputs.endpoint_slices.clone(),
            pods: pods.clone(),
            enable_auto_mtls: settings.enable_auto_mtls,
        })
        .with_metrics(collection_metrics);

        let policies = Arc::new(PolicyIndex::new(policy_sources));
        let routes = Arc::new(RoutesIndex::new(
            RouteInputs {
                http_routes: inputs.http_routes.clone(),
                tcp_routes: inputs.tcp_routes.clone(),
                tls_routes: inputs.tls_routes.clone(),
            },
            backends,
            policies.clone(),
        ));

        let queries = Arc::new(GatewayQueries::new(
            routes.clone(),
            inputs.namespaces.clone(),
            inputs.secrets.clone(),
            refgrants,
        ));
        let translator = Arc::new(
            GatewayTranslator::new(
                settings.controller_name,
                inputs.gateway_classes.clone(),
                policies.clone(),
                queries,
                plugins,
            )
            .with_metrics(metrics.clone()),
        );
        let snapshots = translator
            .snapshots(inputs.gateways.clone())
            .with_metrics(collection_metrics);

        let clients =
            UniqueClients::new(Some(pods.clone()), settings.require_pod_locality).with_metrics(&metrics);
        let assignments = assignments(
            clients.collection().with_metrics(collection_metrics),
            endpoints.clone(),
            settings.failover_priority,
        )
        .with_metrics(collection_metrics);

        Self {
            pods,
            service_backends,
            endpoints,
            policies,
            routes,
            snapshots,
            clients,
            assignments,
        }
    }
}
