use crate::{index::Update, metrics::ControllerMetrics};
use k8s_openapi::NamespaceResourceScope;
use kgateway_translator_core::ObjectSource;
use kgateway_translator_k8s_api::gateway_api as api;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource,
};
use kubert::lease::Claim;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time,
};

pub const FIELD_MANAGER: &str = "kgateway";

/// Applies status patches while this process holds the write lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("status of {0} kinds is not written")]
    UnsupportedKind(String),

    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: Client,
        name: String,
        updates: mpsc::Receiver<Update>,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Runs until the sending side of the update queue is dropped.
    pub async fn run(mut self) {
        let params = PatchParams::apply(FIELD_MANAGER);
        while let Some(Update { id, patch }) = self.updates.recv().await {
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::debug!(%id, "Lost the write lease; dropping status patch");
                self.metrics.skipped();
                continue;
            }

            match time::timeout(self.patch_timeout, self.patch(&id, &patch, &params)).await {
                Ok(Ok(())) => {
                    tracing::debug!(%id, "Patched status");
                    self.metrics.succeeded(&id.kind);
                }
                Ok(Err(error)) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, kind = %id.kind, %error, "Failed to patch status");
                    self.metrics.failed(&id.kind);
                }
                Err(_) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, kind = %id.kind, timeout = ?self.patch_timeout, "Status patch timed out");
                    self.metrics.timed_out(&id.kind);
                }
            }
        }
    }

    async fn patch(
        &self,
        id: &ObjectSource,
        patch: &Patch<serde_json::Value>,
        params: &PatchParams,
    ) -> Result<(), PatchError> {
        let client = self.client.clone();
        match id.kind.as_str() {
            "Gateway" => patch_status::<api::Gateway>(client, id, patch, params).await,
            "HTTPRoute" => patch_status::<api::HttpRoute>(client, id, patch, params).await,
            "TCPRoute" => patch_status::<api::TcpRoute>(client, id, patch, params).await,
            "TLSRoute" => patch_status::<api::TlsRoute>(client, id, patch, params).await,
            kind => Err(PatchError::UnsupportedKind(kind.to_string())),
        }
    }
}

async fn patch_status<K>(
    client: Client,
    id: &ObjectSource,
    patch: &Patch<serde_json::Value>,
    params: &PatchParams,
) -> Result<(), PatchError>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug,
{
    Api::<K>::namespaced(client, &id.namespace)
        .patch_status(&id.name, params, patch)
        .await?;
    Ok(())
}
