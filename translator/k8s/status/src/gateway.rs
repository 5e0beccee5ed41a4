use crate::conditions;
use kgateway_translator_core::report::{GatewayReport, ListenerReport};
use kgateway_translator_k8s_api::{gateway_api as api, Time};

/// The status of a Gateway after translation.
///
/// Listeners are listed in the order the Gateway declares them; a declared
/// listener that was not reported on is healthy with no attached routes.
pub fn gateway_status(
    gateway: &api::Gateway,
    report: &GatewayReport,
    previous: Option<&api::GatewayStatus>,
    now: &Time,
) -> api::GatewayStatus {
    let generation = gateway.metadata.generation;
    let prev_conditions = previous
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    let default_listener = ListenerReport::default();
    let listeners = gateway
        .spec
        .listeners
        .iter()
        .map(|l| {
            let report = report.listeners.get(&l.name).unwrap_or(&default_listener);
            let prev = previous
                .and_then(|s| s.listeners.as_ref())
                .and_then(|ls| ls.iter().find(|p| p.name == l.name))
                .map(|p| p.conditions.as_slice())
                .unwrap_or_default();
            api::ListenerStatus {
                name: l.name.clone(),
                supported_kinds: report
                    .supported_kinds
                    .iter()
                    .map(|gk| api::RouteGroupKind {
                        group: Some(gk.group.clone()),
                        kind: gk.kind.clone(),
                    })
                    .collect(),
                attached_routes: i32::try_from(report.attached_routes).unwrap_or(i32::MAX),
                conditions: conditions::build(
                    &report.conditions,
                    conditions::LISTENER,
                    prev,
                    generation,
                    now,
                ),
            }
        })
        .collect();

    api::GatewayStatus {
        conditions: Some(conditions::build(
            &report.conditions,
            conditions::GATEWAY,
            prev_conditions,
            generation,
            now,
        )),
        listeners: Some(listeners),
    }
}
