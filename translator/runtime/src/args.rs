use crate::{
    collections::{metrics::CollectionMetrics, wait_for_all, StaticCollection},
    core::plugin::PluginRegistry,
    index::{self, load_assignment::PerClientAssignment, GatewaySnapshot, IndexMetrics, Inputs},
    lease, output, reconcile,
    settings::Settings,
    status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::{runtime::watcher, Client, Resource};
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::Duration,
};
use tracing::{info, info_span, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so we set the buffer
// size to be the same as the reconciliation period in milliseconds.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(name = "translator", about = "A Gateway API translator")]
pub struct Args {
    #[clap(
        long,
        default_value = "kgateway=info,warn",
        env = "KGATEWAY_TRANSLATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(flatten)]
    settings: Settings,

    /// The namespace holding the status write Lease.
    #[clap(long, env = "POD_NAMESPACE", default_value = "kgateway-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "kgateway")]
    deployment_name: String,

    #[clap(long, default_value = "kgateway-status-write")]
    lease_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            settings,
            control_plane_namespace,
            deployment_name,
            lease_name,
        } = self;

        let mut prom = <Registry>::default();
        let collection_metrics =
            CollectionMetrics::register(prom.sub_registry_with_prefix("collections"));
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("translator"));
        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the collections that translation is computed from. Nothing is
        // computed until the watches below start delivering objects.
        let inputs = Inputs::new(&collection_metrics);
        let index = index::Index::new(
            &inputs,
            settings.index_settings(),
            PluginRegistry::with_builtins(),
            Vec::new(),
            &collection_metrics,
            index_metrics,
        );

        let hostname = std::env::var("HOSTNAME").context("HOSTNAME must be set")?;
        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &lease_name,
            &deployment_name,
            &hostname,
        )
        .await?;

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index = status::Index::shared(
            hostname.clone(),
            settings.gateway_controller_name.clone(),
            claims.clone(),
            updates_tx,
            status::Sources {
                gateways: inputs.gateways.clone(),
                http_routes: inputs.http_routes.clone(),
                tcp_routes: inputs.tcp_routes.clone(),
                tls_routes: inputs.tls_routes.clone(),
            },
            status_index_metrics,
        );

        // Spawn resource watches. Translation runs on the watch tasks, so a
        // failure in any of them ends the process.
        let mut watches = JoinSet::new();
        let client = runtime.client();
        watch(&mut runtime, &mut watches, inputs.gateway_classes.clone(), "gatewayclasses");
        watch(&mut runtime, &mut watches, inputs.gateways.clone(), "gateways");
        watch(&mut runtime, &mut watches, inputs.http_routes.clone(), "httproutes");
        watch_optional(
            &mut runtime,
            &client,
            &mut watches,
            inputs.tcp_routes.clone(),
            "tcproutes",
        )
        .await;
        watch_optional(
            &mut runtime,
            &client,
            &mut watches,
            inputs.tls_routes.clone(),
            "tlsroutes",
        )
        .await;
        watch_optional(
            &mut runtime,
            &client,
            &mut watches,
            inputs.reference_grants.clone(),
            "referencegrants",
        )
        .await;
        watch(&mut runtime, &mut watches, inputs.namespaces.clone(), "namespaces");
        watch(&mut runtime, &mut watches, inputs.services.clone(), "services");
        watch(&mut runtime, &mut watches, inputs.endpoint_slices.clone(), "endpointslices");
        watch(&mut runtime, &mut watches, inputs.secrets.clone(), "secrets");
        watch(&mut runtime, &mut watches, inputs.pods.clone(), "pods");
        watch(&mut runtime, &mut watches, inputs.nodes.clone(), "nodes");

        let synced = inputs.synced();
        tokio::spawn(
            async move {
                wait_for_all(synced).await;
                info!("All watches synced");
            }
            .instrument(info_span!("sync")),
        );

        // Publish translation results in process.
        let (snapshots_tx, _snapshots_rx) = watch::channel(Default::default());
        tokio::spawn(
            output::publish::<GatewaySnapshot, _>(index.snapshots.clone(), snapshots_tx)
                .instrument(info_span!("snapshots")),
        );
        let (assignments_tx, _assignments_rx) = watch::channel(Default::default());
        tokio::spawn(
            output::publish::<PerClientAssignment, _>(index.assignments.clone(), assignments_tx)
                .instrument(info_span!("load_assignments")),
        );

        // Spawn the status reconciliation.
        tokio::spawn(
            reconcile::run(
                status_index,
                index.snapshots.clone(),
                claims.clone(),
                RECONCILIATION_PERIOD,
            )
            .instrument(info_span!("status_index")),
        );

        let status_controller = status::Controller::new(
            claims,
            client,
            hostname,
            updates_rx,
            Duration::from_millis(settings.status_patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Watches end once it
        // fires; a watch that fails before then aborts the process.
        let shutdown = runtime.run();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    if res.is_err() {
                        bail!("Aborted");
                    }
                    break;
                }
                Some(res) = watches.join_next() => {
                    res.context("watch task failed")?;
                }
            }
        }

        Ok(())
    }
}

fn watch<K, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    watches: &mut JoinSet<()>,
    collection: Arc<StaticCollection<K>>,
    name: &'static str,
) where
    K: Resource + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let events = runtime.watch_all::<K>(watcher::Config::default());
    watches.spawn(collection.run(events).instrument(info_span!("watch", resource = name)));
}

/// Watches a resource kind whose CRD may not be installed. When it is not,
/// the collection stays empty and is marked synced.
async fn watch_optional<K, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    client: &Client,
    watches: &mut JoinSet<()>,
    collection: Arc<StaticCollection<K>>,
    name: &'static str,
) where
    K: Resource + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static,
    K::DynamicType: Default,
{
    if api_resource_exists::<K>(client).await {
        watch(runtime, watches, collection, name);
    } else {
        tracing::warn!(resource = name, "Resource kind not found, skipping watch");
        collection.mark_synced();
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
