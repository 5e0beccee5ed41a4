//! Merges a gateway's logical listeners into physical listeners and builds
//! their filter chains.
//!
//! Listeners that share a (translated) port share a physical listener. All
//! HTTP listeners on a port share one filter chain; HTTPS, TCP, and TLS
//! listeners each contribute their own chains.

use crate::query::{allowed_kinds, default_kinds, GatewayQueries, RouteInfo, RoutesForGwResult, TlsError};
use kgateway_translator_collections::HandlerContext;
use kgateway_translator_core::{
    gateway::{GatewayIr, Listener, Protocol, TlsMode},
    listener::{
        FilterChainCommon, FilterChainMatch, HttpFilterChainIr, ListenerIr, TcpIr, TlsBundle,
        VirtualHostIr,
    },
    policy::AttachedPolicies,
    report::{condition, reason, ConditionReport, ListenerReport, ReportMap},
    route::{HttpRouteRuleMatchIr, PathMatch, RouteIr},
    GroupKind, ObjectSource,
};
use openssl::{pkey::PKey, x509::X509};
use std::{cmp::Ordering, collections::BTreeMap};

/// The listener option that overrides the ALPN protocols of an HTTPS chain,
/// as a comma-separated list.
pub const ALPN_OPTION: &str = "kgateway.dev/alpn-protocols";

const DEFAULT_ALPN: [&str; 2] = ["h2", "http/1.1"];

pub const HTTP_CHAIN_NAME: &str = "http";

/// Privileged ports are bound at an unprivileged offset.
pub fn translate_port(port: u16) -> u16 {
    if port < 1024 {
        port + 8000
    } else {
        port
    }
}

struct MergedListener<'l> {
    names: Vec<String>,
    port: u16,
    http: Vec<(&'l Listener, Vec<RouteInfo>)>,
    https: Vec<HttpFilterChainIr>,
    tcp: Vec<TcpIr>,
}

pub fn translate_listeners(
    ctx: &mut HandlerContext<'_>,
    queries: &GatewayQueries,
    gw: &GatewayIr,
    routes: &RoutesForGwResult,
    reports: &mut ReportMap,
) -> Vec<ListenerIr> {
    let mut merged: Vec<MergedListener<'_>> = Vec::new();
    for l in &gw.listeners {
        let result = routes.listener_results.get(&l.name).cloned().unwrap_or_default();
        {
            let report = reports.gateway(&gw.source).listener(&l.name);
            if !validate_listener(l, result.error.as_ref().map(|e| e.to_string()), report) {
                continue;
            }
            report.attached_routes = attached_routes(&result.routes);
        }

        let port = translate_port(l.port);
        let idx = match merged.iter().position(|m| m.port == port) {
            Some(idx) => idx,
            None => {
                merged.push(MergedListener {
                    names: Vec::new(),
                    port,
                    http: Vec::new(),
                    https: Vec::new(),
                    tcp: Vec::new(),
                });
                merged.len() - 1
            }
        };
        let m = &mut merged[idx];
        m.names.push(l.name.clone());

        match l.protocol {
            Protocol::Http => m.http.push((l, result.routes)),
            Protocol::Https => match resolve_tls(ctx, queries, gw, l) {
                Ok(bundle) => m.https.push(https_chain(gw, l, &result.routes, bundle)),
                Err(error) => tls_failed(reports.gateway(&gw.source).listener(&l.name), &error),
            },
            Protocol::Tcp => m.tcp.extend(tcp_chain(l, &result.routes, reports)),
            Protocol::Tls => {
                let bundle = match l.tls.as_ref().map(|t| t.mode) {
                    Some(TlsMode::Terminate) => match resolve_tls(ctx, queries, gw, l) {
                        Ok(bundle) => Some(bundle),
                        Err(error) => {
                            tls_failed(reports.gateway(&gw.source).listener(&l.name), &error);
                            continue;
                        }
                    },
                    _ => None,
                };
                m.tcp.extend(tls_chains(&result.routes, bundle));
            }
            Protocol::Other(_) => {}
        }
    }

    merged
        .into_iter()
        .filter_map(|m| {
            let mut out = ListenerIr::new(m.names.join("~"), m.port);
            out.attached_policies = gw.attached_policies.clone();
            if !m.http.is_empty() {
                out.http_filter_chains.push(http_chain(gw, &m.http));
            }
            out.http_filter_chains.extend(m.https);
            out.tcp_filter_chains = m.tcp;
            if out.is_empty() {
                tracing::debug!(gateway = %gw.source, listener = %out.name, "Listener has no filter chains");
                return None;
            }
            Some(out)
        })
        .collect()
}

/// Sets the conditions of a listener. Returns false when the listener can't
/// be programmed at all.
fn validate_listener(l: &Listener, error: Option<String>, report: &mut ListenerReport) -> bool {
    if let Protocol::Other(protocol) = &l.protocol {
        report.supported_kinds = vec![];
        report.set_condition(ConditionReport::new(
            condition::ACCEPTED,
            false,
            reason::UNSUPPORTED_PROTOCOL,
            format!("protocol {protocol} is not supported"),
        ));
        report.set_condition(ConditionReport::new(
            condition::PROGRAMMED,
            false,
            reason::INVALID,
            "listener is not accepted",
        ));
        return false;
    }

    if l.protocol == Protocol::Https && l.tls.as_ref().map(|t| t.mode) == Some(TlsMode::Passthrough) {
        report.set_condition(ConditionReport::new(
            condition::ACCEPTED,
            false,
            reason::UNSUPPORTED_VALUE,
            "HTTPS listeners can't use TLS passthrough",
        ));
        report.set_condition(ConditionReport::new(
            condition::PROGRAMMED,
            false,
            reason::INVALID,
            "listener is not accepted",
        ));
        return false;
    }

    let supported = default_kinds(&l.protocol);
    let requested = allowed_kinds(l);
    let (valid, invalid): (Vec<GroupKind>, Vec<GroupKind>) =
        requested.into_iter().partition(|gk| supported.contains(gk));
    report.supported_kinds = valid;
    if !invalid.is_empty() {
        let kinds = invalid.iter().map(|gk| gk.to_string()).collect::<Vec<_>>();
        report.set_condition(ConditionReport::new(
            condition::RESOLVED_REFS,
            false,
            reason::INVALID_ROUTE_KINDS,
            format!("unsupported route kinds: {}", kinds.join(", ")),
        ));
    }

    if let Some(error) = error {
        report.set_condition(ConditionReport::new(
            condition::ACCEPTED,
            false,
            reason::INVALID,
            error,
        ));
        report.set_condition(ConditionReport::new(
            condition::PROGRAMMED,
            false,
            reason::INVALID,
            "listener is not accepted",
        ));
        return false;
    }
    true
}

fn attached_routes(routes: &[RouteInfo]) -> u32 {
    let mut sources = routes.iter().map(|r| r.object.source()).collect::<Vec<_>>();
    sources.sort();
    sources.dedup();
    u32::try_from(sources.len()).unwrap_or(u32::MAX)
}

fn tls_failed(report: &mut ListenerReport, error: &TlsError) {
    tracing::info!(%error, "Listener TLS configuration is invalid");
    let reason = match error {
        TlsError::RefNotPermitted(_) => reason::REF_NOT_PERMITTED,
        TlsError::NotFound(_) | TlsError::InvalidKind(_) | TlsError::InvalidCertificate(_) => {
            reason::INVALID_CERTIFICATE_REF
        }
    };
    report.set_condition(ConditionReport::new(
        condition::RESOLVED_REFS,
        false,
        reason,
        error.to_string(),
    ));
    report.set_condition(ConditionReport::new(
        condition::PROGRAMMED,
        false,
        reason::INVALID,
        "TLS configuration could not be resolved",
    ));
}

fn http_chain(gw: &GatewayIr, parents: &[(&Listener, Vec<RouteInfo>)]) -> HttpFilterChainIr {
    let mut network = AttachedPolicies::default();
    for (l, _) in parents {
        network.append(&l.attached_policies);
    }
    HttpFilterChainIr {
        common: FilterChainCommon {
            name: HTTP_CHAIN_NAME.to_string(),
            matcher: FilterChainMatch::default(),
            tls: None,
        },
        vhosts: build_vhosts(HTTP_CHAIN_NAME, parents),
        attached_policies: gw.attached_http_policies.clone(),
        attached_network_policies: network,
    }
}

fn https_chain(gw: &GatewayIr, l: &Listener, routes: &[RouteInfo], bundle: TlsBundle) -> HttpFilterChainIr {
    let parents = [(l, routes.to_vec())];
    HttpFilterChainIr {
        common: FilterChainCommon {
            name: l.name.clone(),
            matcher: FilterChainMatch {
                sni_domains: l.hostname.iter().cloned().collect(),
            },
            tls: Some(bundle),
        },
        vhosts: build_vhosts(&l.name, &parents),
        attached_policies: gw.attached_http_policies.clone(),
        attached_network_policies: l.attached_policies.clone(),
    }
}

/// Only the oldest TCP route is used. Newer routes are reported as not
/// accepted.
fn tcp_chain(l: &Listener, routes: &[RouteInfo], reports: &mut ReportMap) -> Option<TcpIr> {
    let mut tcp = routes
        .iter()
        .filter(|r| matches!(r.object.as_ref(), RouteIr::Tcp(_)))
        .collect::<Vec<_>>();
    tcp.sort_by(|a, b| route_age(&a.object, &b.object));

    let (oldest, rest) = tcp.split_first()?;
    for r in rest {
        reports
            .parent_ref(r.object.source(), &r.parent_ref)
            .set_condition(ConditionReport::new(
                condition::ACCEPTED,
                false,
                reason::MULTIPLE_ROUTES,
                format!(
                    "listener {} already uses route {}",
                    l.name,
                    oldest.object.source().namespaced_name()
                ),
            ));
    }

    let RouteIr::Tcp(route) = oldest.object.as_ref() else {
        return None;
    };
    Some(TcpIr {
        common: FilterChainCommon {
            name: tcp_chain_name(&route.source),
            matcher: FilterChainMatch::default(),
            tls: None,
        },
        route: route.source.clone(),
        parent_ref: oldest.parent_ref.clone(),
        backends: route.backends.clone(),
    })
}

/// One chain per TLS route, matched by the route's SNI hostnames.
fn tls_chains(routes: &[RouteInfo], bundle: Option<TlsBundle>) -> Vec<TcpIr> {
    let mut tls = routes
        .iter()
        .filter_map(|r| match r.object.as_ref() {
            RouteIr::Tls(route) => Some((r, route)),
            _ => None,
        })
        .collect::<Vec<_>>();
    tls.sort_by(|(a, _), (b, _)| route_age(&a.object, &b.object));

    tls.into_iter()
        .map(|(info, route)| TcpIr {
            common: FilterChainCommon {
                name: tcp_chain_name(&route.source),
                matcher: FilterChainMatch {
                    sni_domains: info.hostnames.iter().filter(|h| *h != "*").cloned().collect(),
                },
                tls: bundle.clone(),
            },
            route: route.source.clone(),
            parent_ref: info.parent_ref.clone(),
            backends: route.backends.clone(),
        })
        .collect()
}

fn tcp_chain_name(route: &ObjectSource) -> String {
    format!("{}.{}-rule-0", route.namespace, route.name)
}

/// Oldest first. Routes created at the same time are ordered by namespace and
/// name.
fn route_age(a: &RouteIr, b: &RouteIr) -> Ordering {
    let ta = a.creation().map(|t| t.0);
    let tb = b.creation().map(|t| t.0);
    ta.cmp(&tb).then_with(|| {
        let (a, b) = (a.source(), b.source());
        (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name))
    })
}

struct VhostBuilder {
    rules: Vec<HttpRouteRuleMatchIr>,
    /// The length of the most specific listener hostname seen for the host.
    specificity: Option<usize>,
    policies: AttachedPolicies,
}

/// Groups rules by hostname across all parents of a chain. Each host takes
/// the policies of the listener with the most specific hostname.
fn build_vhosts(chain: &str, parents: &[(&Listener, Vec<RouteInfo>)]) -> Vec<VirtualHostIr> {
    let mut hosts = BTreeMap::<String, VhostBuilder>::new();
    for (l, routes) in parents {
        let specificity = l.hostname.as_deref().map_or(0, str::len);
        for route in routes {
            for host in &route.hostnames {
                let vh = hosts.entry(host.clone()).or_insert_with(|| VhostBuilder {
                    rules: Vec::new(),
                    specificity: None,
                    policies: AttachedPolicies::default(),
                });
                if vh.specificity.is_none_or(|s| specificity > s) {
                    vh.specificity = Some(specificity);
                    vh.policies = l.attached_policies.clone();
                }
                for rule in &route.rules {
                    if !vh.rules.iter().any(|r| same_rule(r, rule)) {
                        vh.rules.push(rule.clone());
                    }
                }
            }
        }
    }

    hosts
        .into_iter()
        .map(|(host, mut vh)| {
            vh.rules.sort_by(rule_precedence);
            VirtualHostIr {
                name: format!("{chain}~{host}"),
                hostname: host,
                rules: vh.rules,
                attached_policies: vh.policies,
            }
        })
        .collect()
}

fn same_rule(a: &HttpRouteRuleMatchIr, b: &HttpRouteRuleMatchIr) -> bool {
    a.parent.source == b.parent.source
        && a.rule_index == b.rule_index
        && a.match_index == b.match_index
        && a.delegation_chain == b.delegation_chain
}

/// Orders rules so that more specific matches are evaluated first: exact
/// paths, then longer paths, then matches that constrain the method, headers,
/// and query parameters. Ties go to the older route.
fn rule_precedence(a: &HttpRouteRuleMatchIr, b: &HttpRouteRuleMatchIr) -> Ordering {
    fn path_rank(p: &PathMatch) -> u8 {
        match p {
            PathMatch::Exact(_) => 0,
            PathMatch::RegularExpression(_) => 1,
            PathMatch::PathPrefix(_) => 2,
        }
    }

    let (am, bm) = (&a.matcher, &b.matcher);
    path_rank(&am.path)
        .cmp(&path_rank(&bm.path))
        .then_with(|| bm.path.value().len().cmp(&am.path.value().len()))
        .then_with(|| bm.method.is_some().cmp(&am.method.is_some()))
        .then_with(|| bm.headers.len().cmp(&am.headers.len()))
        .then_with(|| bm.query_params.len().cmp(&am.query_params.len()))
        .then_with(|| {
            let ta = a.parent.creation.as_ref().map(|t| t.0);
            let tb = b.parent.creation.as_ref().map(|t| t.0);
            ta.cmp(&tb)
        })
        .then_with(|| {
            let (sa, sb) = (&a.parent.source, &b.parent.source);
            (&sa.namespace, &sa.name).cmp(&(&sb.namespace, &sb.name))
        })
        .then_with(|| a.rule_index.cmp(&b.rule_index))
        .then_with(|| a.match_index.cmp(&b.match_index))
}

fn resolve_tls(
    ctx: &mut HandlerContext<'_>,
    queries: &GatewayQueries,
    gw: &GatewayIr,
    l: &Listener,
) -> Result<TlsBundle, TlsError> {
    let tls = l
        .tls
        .as_ref()
        .ok_or_else(|| TlsError::InvalidCertificate("listener has no TLS configuration".to_string()))?;
    let cert_ref = tls
        .certificate_refs
        .first()
        .ok_or_else(|| TlsError::InvalidCertificate("no certificate references".to_string()))?;
    let secret = queries.get_secret_for_ref(ctx, &gw.source, cert_ref)?;

    let data = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
    };
    let cert_chain = data("tls.crt")
        .ok_or_else(|| TlsError::InvalidCertificate("secret has no tls.crt".to_string()))?;
    let private_key = data("tls.key")
        .ok_or_else(|| TlsError::InvalidCertificate("secret has no tls.key".to_string()))?;
    validate_key_pair(&cert_chain, &private_key)?;

    let alpn_protocols = match tls.options.iter().find(|(k, _)| k == ALPN_OPTION) {
        Some((_, v)) => v
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Into::into)
            .collect(),
        None => DEFAULT_ALPN.iter().map(|p| p.to_string()).collect(),
    };

    Ok(TlsBundle {
        ca: data("ca.crt").unwrap_or_default(),
        cert_chain,
        private_key,
        alpn_protocols,
    })
}

/// Checks that the PEM chain parses and that the private key belongs to the
/// leaf certificate.
pub fn validate_key_pair(cert_chain: &[u8], private_key: &[u8]) -> Result<(), TlsError> {
    let invalid = |e: openssl::error::ErrorStack| TlsError::InvalidCertificate(e.to_string());

    let chain = X509::stack_from_pem(cert_chain).map_err(invalid)?;
    let leaf = chain
        .first()
        .ok_or_else(|| TlsError::InvalidCertificate("no certificates found".to_string()))?;
    let key = PKey::private_key_from_pem(private_key).map_err(invalid)?;
    let public = leaf.public_key().map_err(invalid)?;
    if !public.public_eq(&key) {
        return Err(TlsError::InvalidCertificate(
            "private key does not match the certificate".to_string(),
        ));
    }
    Ok(())
}
