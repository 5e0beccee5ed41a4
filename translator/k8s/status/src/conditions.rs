use kgateway_translator_core::report::{condition, reason, ConditionReport};
use kgateway_translator_k8s_api::{Condition, Time};

/// A condition type with the status and reason it has when nothing was
/// reported about it.
pub(crate) type Healthy = (&'static str, bool, &'static str);

pub(crate) const GATEWAY: &[Healthy] = &[
    (condition::ACCEPTED, true, reason::ACCEPTED),
    (condition::PROGRAMMED, true, reason::PROGRAMMED),
];

pub(crate) const LISTENER: &[Healthy] = &[
    (condition::ACCEPTED, true, reason::ACCEPTED),
    (condition::CONFLICTED, false, reason::NO_CONFLICTS),
    (condition::PROGRAMMED, true, reason::PROGRAMMED),
    (condition::RESOLVED_REFS, true, reason::RESOLVED_REFS),
];

pub(crate) const ROUTE_PARENT: &[Healthy] = &[
    (condition::ACCEPTED, true, reason::ACCEPTED),
    (condition::RESOLVED_REFS, true, reason::RESOLVED_REFS),
];

/// Builds the conditions of an object from what was reported about it.
///
/// Every healthy type is present, followed by any other reported types in the
/// order they were reported. A condition whose status, reason, and message
/// match the previous condition of its type keeps its transition time.
pub(crate) fn build(
    reported: &[ConditionReport],
    healthy: &[Healthy],
    previous: &[Condition],
    observed_generation: Option<i64>,
    now: &Time,
) -> Vec<Condition> {
    let defaults = healthy.iter().map(|(type_, status, reason)| {
        reported
            .iter()
            .find(|c| c.type_ == *type_)
            .cloned()
            .unwrap_or_else(|| ConditionReport::new(*type_, *status, *reason, ""))
    });
    let extra = reported
        .iter()
        .filter(|c| !healthy.iter().any(|(type_, _, _)| c.type_ == *type_))
        .cloned();

    defaults
        .chain(extra)
        .map(|c| {
            let status = if c.status { "True" } else { "False" };
            let last_transition_time = previous
                .iter()
                .find(|p| {
                    p.type_ == c.type_
                        && p.status == status
                        && p.reason == c.reason
                        && p.message == c.message
                })
                .map(|p| p.last_transition_time.clone())
                .unwrap_or_else(|| now.clone());
            Condition {
                type_: c.type_,
                status: status.to_string(),
                reason: c.reason,
                message: c.message,
                observed_generation,
                last_transition_time,
            }
        })
        .collect()
}
