use crate::{
    collections::{changes, Collection, Source},
    core::report::ReportMap,
    index::GatewaySnapshot,
    k8s::Time,
    status,
};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, time};

/// Feeds the reports of every gateway snapshot to the status index.
///
/// Reconciliation runs whenever a snapshot changes and whenever the write
/// lease changes hands. Each period, statuses that were sent but never landed
/// are forgotten so they are sent again.
pub async fn run<C>(
    index: status::SharedIndex,
    snapshots: Arc<C>,
    mut claims: watch::Receiver<Arc<Claim>>,
    period: time::Duration,
) where
    C: Collection<GatewaySnapshot> + ?Sized,
{
    let mut changes = changes(&*snapshots);
    snapshots.synced().wait_until_synced().await;

    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            batch = changes.recv() => {
                if batch.is_none() {
                    return;
                }
                changes.drain();
            }
            res = claims.changed() => {
                if res.is_err() {
                    tracing::debug!("Lease manager stopped");
                    return;
                }
                tracing::info!(holder = %claims.borrow_and_update().holder, "Status write lease changed");
                index.write().reset();
            }
            _ = interval.tick() => {
                index.write().resync();
            }
        }

        let reports = merged_reports(&*snapshots);
        index
            .write()
            .reconcile(&reports, Time(chrono::Utc::now()));
    }
}

/// Route reports are combined across gateways, since a route may be
/// attached to several.
fn merged_reports<C>(snapshots: &C) -> ReportMap
where
    C: Collection<GatewaySnapshot> + ?Sized,
{
    let mut snapshots = snapshots.list();
    snapshots.sort_by(|a, b| a.gateway.cmp(&b.gateway));
    let mut reports = ReportMap::default();
    for snapshot in snapshots {
        reports.merge(&snapshot.reports);
    }
    reports
}
