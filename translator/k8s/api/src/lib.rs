#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gateway_api;
pub mod labels;

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Namespace, Node, Pod, PodSpec, PodStatus, Secret, Service, ServicePort, ServiceSpec,
        },
        discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::{
        apis::meta::v1::{Condition, Time},
        util::intstr::IntOrString,
    },
};
pub use kube::api::{ObjectMeta, ResourceExt};

/// Checks whether a group/kind pair names the given resource type. The empty
/// group and `core` are treated alike.
pub fn targets_kind<T>(group: Option<&str>, kind: &str) -> bool
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();

    let mut t_group = &*T::group(&dt);
    if t_group.is_empty() {
        t_group = "core";
    }

    let group = match group {
        None | Some("") => "core",
        Some(g) => g,
    };

    group.eq_ignore_ascii_case(t_group) && *kind == *T::kind(&dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_kinds() {
        assert!(targets_kind::<Service>(None, "Service"));
        assert!(targets_kind::<Service>(Some(""), "Service"));
        assert!(targets_kind::<Service>(Some("core"), "Service"));
        assert!(!targets_kind::<Service>(Some("core"), "Pod"));
        assert!(targets_kind::<gateway_api::Gateway>(
            Some("gateway.networking.k8s.io"),
            "Gateway"
        ));
        assert!(!targets_kind::<gateway_api::Gateway>(None, "Gateway"));
    }
}
