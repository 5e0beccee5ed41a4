use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    translations: Family<GatewayLabels, Counter>,
    listeners: Family<GatewayLabels, Gauge>,
    route_configs: Family<GatewayLabels, Gauge>,
    clusters: Family<GatewayLabels, Gauge>,
    connected_clients: Gauge,
    client_streams: Gauge,
    client_errors: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct GatewayLabels {
    namespace: String,
    gateway: String,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "gateway_translations",
            "Count of translations of a gateway",
            metrics.translations.clone(),
        );
        prom.register(
            "gateway_listeners",
            "Gauge of the number of listeners produced for a gateway",
            metrics.listeners.clone(),
        );
        prom.register(
            "gateway_route_configs",
            "Gauge of the number of route configurations produced for a gateway",
            metrics.route_configs.clone(),
        );
        prom.register(
            "gateway_clusters",
            "Gauge of the number of clusters produced for a gateway",
            metrics.clusters.clone(),
        );
        prom.register(
            "xds_unique_clients",
            "Gauge of the number of distinct connected proxy identities",
            metrics.connected_clients.clone(),
        );
        prom.register(
            "xds_client_streams",
            "Gauge of the number of streams with a resolved identity",
            metrics.client_streams.clone(),
        );
        prom.register(
            "xds_client_errors",
            "Count of stream requests whose identity could not be resolved",
            metrics.client_errors.clone(),
        );
        metrics
    }

    pub(crate) fn translated(
        &self,
        namespace: &str,
        gateway: &str,
        listeners: usize,
        route_configs: usize,
        clusters: usize,
    ) {
        let labels = GatewayLabels {
            namespace: namespace.to_string(),
            gateway: gateway.to_string(),
        };
        self.translations.get_or_create(&labels).inc();
        self.listeners.get_or_create(&labels).set(listeners as i64);
        self.route_configs
            .get_or_create(&labels)
            .set(route_configs as i64);
        self.clusters.get_or_create(&labels).set(clusters as i64);
    }

    pub(crate) fn set_clients(&self, clients: usize, streams: usize) {
        self.connected_clients.set(clients as i64);
        self.client_streams.set(streams as i64);
    }

    pub(crate) fn inc_client_errors(&self) {
        self.client_errors.inc();
    }

    #[cfg(test)]
    pub(crate) fn translations(&self, namespace: &str, gateway: &str) -> u64 {
        self.translations
            .get_or_create(&GatewayLabels {
                namespace: namespace.to_string(),
                gateway: gateway.to_string(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn connected_clients(&self) -> i64 {
        self.connected_clients.get()
    }
}
