use crate::conditions;
use kgateway_translator_core::{report::RouteReport, route::ParentRef};
use kgateway_translator_k8s_api::{gateway_api as api, Time};

/// The status of a route after translation.
///
/// Parent statuses written by other controllers are kept as they are on the
/// live object. Ours are replaced by the reported parents, so a parent that
/// is no longer reported on is removed.
pub fn route_status(
    controller_name: &str,
    live: Option<&api::RouteStatus>,
    previous: Option<&api::RouteStatus>,
    report: &RouteReport,
    generation: Option<i64>,
    now: &Time,
) -> api::RouteStatus {
    let foreign = live
        .into_iter()
        .flat_map(|s| s.parents.iter())
        .filter(|p| p.controller_name != controller_name)
        .cloned();

    let ours = report.parents.iter().map(|(parent, pr)| {
        let parent_ref = parent_reference(parent);
        let prev = previous
            .into_iter()
            .flat_map(|s| s.parents.iter())
            .find(|p| p.controller_name == controller_name && p.parent_ref == parent_ref)
            .map(|p| p.conditions.as_slice())
            .unwrap_or_default();
        api::RouteParentStatus {
            conditions: conditions::build(
                &pr.conditions,
                conditions::ROUTE_PARENT,
                prev,
                generation,
                now,
            ),
            parent_ref,
            controller_name: controller_name.to_string(),
        }
    });

    api::RouteStatus {
        parents: foreign.chain(ours).collect(),
    }
}

pub fn parent_reference(parent: &ParentRef) -> api::ParentReference {
    api::ParentReference {
        group: parent.group.clone(),
        kind: parent.kind.clone(),
        namespace: parent.namespace.clone(),
        name: parent.name.clone(),
        section_name: parent.section_name.clone(),
        port: parent.port.map(i32::from),
    }
}
