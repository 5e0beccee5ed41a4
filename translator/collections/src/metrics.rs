use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metrics shared by all collections registered with them.
#[derive(Clone, Debug, Default)]
pub struct CollectionMetrics {
    size: Family<CollectionLabels, Gauge>,
    synced: Family<CollectionLabels, Gauge>,
    applies: Family<CollectionLabels, Counter>,
    deletes: Family<CollectionLabels, Counter>,
    resets: Family<CollectionLabels, Counter>,
    recomputes: Family<CollectionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CollectionLabels {
    collection: String,
}

impl CollectionMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "collection_size",
            "Gauge of the number of values in a collection",
            metrics.size.clone(),
        );
        prom.register(
            "collection_synced",
            "Whether a collection has computed its initial state",
            metrics.synced.clone(),
        );
        prom.register(
            "collection_applies",
            "Count of values applied to a watched collection",
            metrics.applies.clone(),
        );
        prom.register(
            "collection_deletes",
            "Count of values deleted from a watched collection",
            metrics.deletes.clone(),
        );
        prom.register(
            "collection_resets",
            "Count of resets of a watched collection",
            metrics.resets.clone(),
        );
        prom.register(
            "collection_recomputes",
            "Count of input keys recomputed by a derived collection",
            metrics.recomputes.clone(),
        );
        metrics
    }

    pub(crate) fn set_size(&self, collection: &str, size: usize) {
        self.size
            .get_or_create(&labels(collection))
            .set(size as i64);
    }

    pub(crate) fn set_synced(&self, collection: &str) {
        self.synced.get_or_create(&labels(collection)).set(1);
    }

    pub(crate) fn inc_applies(&self, collection: &str) {
        self.applies.get_or_create(&labels(collection)).inc();
    }

    pub(crate) fn inc_deletes(&self, collection: &str) {
        self.deletes.get_or_create(&labels(collection)).inc();
    }

    pub(crate) fn inc_resets(&self, collection: &str) {
        self.resets.get_or_create(&labels(collection)).inc();
    }

    pub(crate) fn inc_recomputes(&self, collection: &str) {
        self.recomputes.get_or_create(&labels(collection)).inc();
    }

    #[cfg(test)]
    pub(crate) fn size(&self, collection: &str) -> i64 {
        self.size.get_or_create(&labels(collection)).get()
    }
}

fn labels(collection: &str) -> CollectionLabels {
    CollectionLabels {
        collection: collection.to_string(),
    }
}
