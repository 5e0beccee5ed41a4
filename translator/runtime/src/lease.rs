use crate::{k8s::ObjectMeta, status};
use anyhow::Result;
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use kube::{
    api::{Api, Patch, PatchParams},
    Resource,
};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Creates the status write Lease if it does not exist and starts competing
/// for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    lease_name: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The Deployment owns the Lease, when it can be found.
    let deployment = Api::<Deployment>::namespaced(runtime.client(), ns)
        .get_opt(deployment_name)
        .await?;
    let owner_references = deployment
        .and_then(|d| d.controller_owner_ref(&()))
        .map(|owner| vec![owner]);

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references,
            labels: Some(
                [
                    ("app.kubernetes.io/name".to_string(), "kgateway".to_string()),
                    (
                        "app.kubernetes.io/component".to_string(),
                        "translator".to_string(),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            lease_name,
            &PatchParams {
                field_manager: Some(status::FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
