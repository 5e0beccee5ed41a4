use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patch_succeeded: Family<KindLabels, Counter>,
    patch_failed: Family<KindLabels, Counter>,
    patch_timeout: Family<KindLabels, Counter>,
    patch_skipped: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    patch_enqueued: Family<KindLabels, Counter>,
    patch_channel_full: Counter,
    reconciles: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

fn kind(kind: &str) -> KindLabels {
    KindLabels {
        kind: kind.to_string(),
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            metrics.patch_succeeded.clone(),
        );
        prom.register(
            "patch_failed",
            "Count of failed status patches",
            metrics.patch_failed.clone(),
        );
        prom.register(
            "patch_timeout",
            "Count of status patches that did not complete in time",
            metrics.patch_timeout.clone(),
        );
        prom.register(
            "patch_skipped",
            "Count of status patches dropped because the write lease is held elsewhere",
            metrics.patch_skipped.clone(),
        );
        metrics
    }

    pub(crate) fn succeeded(&self, k: &str) {
        self.patch_succeeded.get_or_create(&kind(k)).inc();
    }

    pub(crate) fn failed(&self, k: &str) {
        self.patch_failed.get_or_create(&kind(k)).inc();
    }

    pub(crate) fn timed_out(&self, k: &str) {
        self.patch_timeout.get_or_create(&kind(k)).inc();
    }

    pub(crate) fn skipped(&self) {
        self.patch_skipped.inc();
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "patch_enqueued",
            "Count of status patches sent to the controller",
            metrics.patch_enqueued.clone(),
        );
        prom.register(
            "patch_channel_full",
            "Count of status patches dropped because the patch queue was full",
            metrics.patch_channel_full.clone(),
        );
        prom.register(
            "reconciles",
            "Count of reconciliations of translation reports",
            metrics.reconciles.clone(),
        );
        metrics
    }

    pub(crate) fn enqueued(&self, k: &str) {
        self.patch_enqueued.get_or_create(&kind(k)).inc();
    }

    pub(crate) fn channel_full(&self) {
        self.patch_channel_full.inc();
    }

    pub(crate) fn reconciled(&self) {
        self.reconciles.inc();
    }

    #[cfg(test)]
    pub(crate) fn enqueued_count(&self, k: &str) -> u64 {
        self.patch_enqueued.get_or_create(&kind(k)).get()
    }
}
