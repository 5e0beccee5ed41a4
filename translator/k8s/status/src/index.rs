use crate::{gateway::gateway_status, metrics::IndexMetrics, routes::route_status};
use ahash::AHashMap as HashMap;
use kgateway_translator_collections::{Collection, StaticCollection};
use kgateway_translator_core::{
    report::{ReportMap, RouteReport},
    ObjectSource,
};
use kgateway_translator_k8s_api::{gateway_api as api, Time};
use kube::{api::Patch, Resource};
use kubert::lease::Claim;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// The live objects whose status is written.
#[derive(Clone)]
pub struct Sources {
    pub gateways: Arc<StaticCollection<api::Gateway>>,
    pub http_routes: Arc<StaticCollection<api::HttpRoute>>,
    pub tcp_routes: Arc<StaticCollection<api::TcpRoute>>,
    pub tls_routes: Arc<StaticCollection<api::TlsRoute>>,
}

/// Turns translation reports into status patches.
///
/// Only the holder of the write lease produces patches. The last status sent
/// for each object is remembered so that unchanged statuses are not patched
/// again.
pub struct Index {
    name: String,
    controller_name: String,
    claims: watch::Receiver<Arc<Claim>>,
    updates: mpsc::Sender<Update>,
    sources: Sources,
    gateways: HashMap<ObjectSource, api::GatewayStatus>,
    routes: HashMap<ObjectSource, api::RouteStatus>,
    metrics: IndexMetrics,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ObjectSource,
    pub patch: Patch<serde_json::Value>,
}

/// The generation and status of a live route.
struct LiveRoute {
    generation: Option<i64>,
    status: Option<api::RouteStatus>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        controller_name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        updates: mpsc::Sender<Update>,
        sources: Sources,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            controller_name: controller_name.to_string(),
            claims,
            updates,
            sources,
            gateways: HashMap::new(),
            routes: HashMap::new(),
            metrics,
        }))
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    /// Sends a patch for every object whose status differs from the one last
    /// sent. Routes that were previously written but are no longer reported
    /// have our parent statuses removed.
    pub fn reconcile(&mut self, reports: &ReportMap, now: Time) {
        if !self.is_leader() {
            tracing::trace!("Not the write leader; skipping status reconciliation");
            return;
        }
        self.metrics.reconciled();

        for (id, report) in &reports.gateways {
            let Some(gw) = self.sources.gateways.get(&id.namespaced_name()) else {
                continue;
            };
            let live = gw.status.as_ref();
            let status = gateway_status(&gw, report, self.gateways.get(id).or(live), &now);
            if self.gateways.get(id) == Some(&status) {
                continue;
            }
            if live == Some(&status) {
                self.gateways.insert(id.clone(), status);
                continue;
            }
            let patch = make_patch::<api::Gateway>(&id.name, &status);
            if self.send(id, patch) {
                self.gateways.insert(id.clone(), status);
            }
        }

        let empty = RouteReport::default();
        let detached = self
            .routes
            .keys()
            .filter(|id| !reports.routes.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        let routes = reports
            .routes
            .iter()
            .map(|(id, r)| (id.clone(), r))
            .chain(detached.into_iter().map(|id| (id, &empty)));

        for (id, report) in routes {
            let Some(live) = self.live_route(&id) else {
                self.routes.remove(&id);
                continue;
            };
            let status = route_status(
                &self.controller_name,
                live.status.as_ref(),
                self.routes.get(&id).or(live.status.as_ref()),
                report,
                live.generation,
                &now,
            );
            if self.routes.get(&id) == Some(&status) {
                continue;
            }
            let sent = live.status.as_ref() == Some(&status)
                || route_patch(&id, &status).is_some_and(|patch| self.send(&id, patch));
            if !sent {
                continue;
            }
            if report.parents.is_empty() {
                self.routes.remove(&id);
            } else {
                self.routes.insert(id, status);
            }
        }
    }

    /// Forgets statuses that were sent but never observed on the live object,
    /// so that the next reconciliation sends them again.
    pub fn resync(&mut self) {
        let gateways = &self.sources.gateways;
        self.gateways.retain(|id, status| {
            gateways
                .get(&id.namespaced_name())
                .is_some_and(|gw| gw.status.as_ref() == Some(status))
        });

        let stale = self
            .routes
            .iter()
            .filter(|(id, status)| {
                self.live_route(id)
                    .map_or(true, |live| live.status.as_ref() != Some(*status))
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in stale {
            self.routes.remove(&id);
        }
    }

    /// Forgets everything sent, e.g. after the write lease changed hands.
    pub fn reset(&mut self) {
        self.gateways.clear();
        self.routes.clear();
    }

    fn live_route(&self, id: &ObjectSource) -> Option<LiveRoute> {
        let key = id.namespaced_name();
        match id.kind.as_str() {
            "HTTPRoute" => self.sources.http_routes.get(&key).map(|r| LiveRoute {
                generation: r.metadata.generation,
                status: r.status.clone(),
            }),
            "TCPRoute" => self.sources.tcp_routes.get(&key).map(|r| LiveRoute {
                generation: r.metadata.generation,
                status: r.status.clone(),
            }),
            "TLSRoute" => self.sources.tls_routes.get(&key).map(|r| LiveRoute {
                generation: r.metadata.generation,
                status: r.status.clone(),
            }),
            _ => None,
        }
    }

    /// Returns false if the patch could not be queued.
    fn send(&self, id: &ObjectSource, patch: Patch<serde_json::Value>) -> bool {
        let update = Update {
            id: id.clone(),
            patch,
        };
        match self.updates.try_send(update) {
            Ok(()) => {
                self.metrics.enqueued(&id.kind);
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%id, "Status patch queue is full");
                self.metrics.channel_full();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!(%id, "Status controller is not running");
                false
            }
        }
    }
}

fn route_patch(id: &ObjectSource, status: &api::RouteStatus) -> Option<Patch<serde_json::Value>> {
    match id.kind.as_str() {
        "HTTPRoute" => Some(make_patch::<api::HttpRoute>(&id.name, status)),
        "TCPRoute" => Some(make_patch::<api::TcpRoute>(&id.name, status)),
        "TLSRoute" => Some(make_patch::<api::TlsRoute>(&id.name, status)),
        _ => None,
    }
}

pub(crate) fn make_patch<K>(name: &str, status: &impl Serialize) -> Patch<serde_json::Value>
where
    K: Resource<DynamicType = ()>,
{
    let value = serde_json::json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "name": name,
        "status": status,
    });
    Patch::Merge(value)
}
