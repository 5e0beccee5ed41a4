use crate::index::{self, load_assignment::Priorities};
use clap::{ArgAction, Parser};

/// Feature flags of the translator.
///
/// Boolean flags take an explicit `true` or `false`; any other value is
/// rejected when arguments are parsed.
#[derive(Clone, Debug, Parser)]
pub struct Settings {
    /// Adds transport socket match metadata to endpoints of mesh workloads.
    /// Only takes effect with `--enable-istio-integration=true`.
    #[clap(
        long,
        env = "KGW_ENABLE_ISTIO_AUTO_MTLS",
        default_value = "false",
        action = ArgAction::Set,
    )]
    pub enable_istio_auto_mtls: bool,

    #[clap(
        long,
        env = "KGW_ENABLE_ISTIO_INTEGRATION",
        default_value = "false",
        action = ArgAction::Set,
    )]
    pub enable_istio_integration: bool,

    /// Fails the stream of a proxy whose pod can't be found, instead of
    /// serving it without a locality.
    #[clap(
        long,
        env = "KGW_REQUIRE_POD_LOCALITY",
        default_value = "true",
        action = ArgAction::Set,
    )]
    pub require_pod_locality: bool,

    /// Labels, as `label[=value]`, that endpoints are prioritized by within a
    /// locality. Earlier labels take precedence.
    #[clap(long, env = "KGW_FAILOVER_PRIORITY", value_delimiter = ',')]
    pub failover_priority: Vec<String>,

    #[clap(
        long,
        env = "KGW_GATEWAY_CONTROLLER_NAME",
        default_value = "kgateway.dev/kgateway"
    )]
    pub gateway_controller_name: String,

    #[clap(long, env = "KGW_STATUS_PATCH_TIMEOUT_MS", default_value = "5000")]
    pub status_patch_timeout_ms: u64,
}

impl Settings {
    /// The settings of the translation indices.
    pub fn index_settings(&self) -> index::Settings {
        if self.enable_istio_auto_mtls && !self.enable_istio_integration {
            tracing::warn!(
                "Istio auto mTLS is enabled without Istio integration; endpoints will not be marked for mTLS"
            );
        }
        index::Settings {
            controller_name: self.gateway_controller_name.clone(),
            enable_auto_mtls: self.enable_istio_auto_mtls && self.enable_istio_integration,
            require_pod_locality: self.require_pod_locality,
            failover_priority: Priorities::parse(self.failover_priority.as_slice()),
        }
    }
}
