//! Routing strategies — section 4.D. Pure functions: (tool name, candidate
//! backends) → a single `RoutingDecision`, or a typed `Routing`/`NoHealthyBackends`
//! error naming the tool.
//!
//! Grounded on the reference implementation's
//! `domain/services/routing_strategies.py` (`route_by_capability`,
//! `route_by_path`, `route_by_fallback`), translated from `fnmatch.fnmatch`
//! to the `glob` crate's `Pattern::matches` for shell-style `*`/`?` matching.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::backend::{Backend, RouteStrategy};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Capability,
    Path,
    Fallback,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Capability
    }
}

/// `RoutingDecision` — section 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub backend_name: String,
    pub reason: String,
    pub alternatives: Vec<String>,
    pub strategy_used: Strategy,
}

fn healthy_candidates(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    backends.iter().filter(|b| b.is_healthy()).cloned().collect()
}

/// If `backends` has no healthy candidate and at least one is unhealthy
/// specifically because its circuit is OPEN, names the lowest-priority such
/// backend. Callers check this before `route`, so a circuit-open candidate
/// surfaces `CircuitBreakerOpen` instead of being silently absorbed into
/// `NoHealthyBackends` by the per-strategy healthy-filter preamble — section
/// 4.G step 4, reached without ever building a client or issuing network I/O.
pub fn circuit_open_blocker(backends: &[Arc<Backend>]) -> Option<String> {
    if !healthy_candidates(backends).is_empty() {
        return None;
    }
    let mut open: Vec<&Arc<Backend>> = backends
        .iter()
        .filter(|b| b.circuit_state() == crate::domain::health::CircuitState::Open)
        .collect();
    open.sort_by_key(|b| b.config.priority);
    open.first().map(|b| b.name().to_string())
}

fn sort_by_priority(mut backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
    // `sort_by_key` is stable, so candidates of equal priority keep their
    // incoming (registration) order — section 4.D "ties: registration order".
    backends.sort_by_key(|b| b.config.priority);
    backends
}

fn decision_from_sorted(
    sorted: Vec<Arc<Backend>>,
    reason: String,
    strategy_used: Strategy,
) -> RoutingDecision {
    let backend_name = sorted[0].name().to_string();
    let alternatives = sorted[1..].iter().map(|b| b.name().to_string()).collect();
    RoutingDecision {
        backend_name,
        reason,
        alternatives,
        strategy_used,
    }
}

/// `route_by_capability` — section 4.D.
pub fn route_by_capability(tool_name: &str, backends: &[Arc<Backend>]) -> Result<RoutingDecision> {
    if backends.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }
    let healthy = healthy_candidates(backends);
    if healthy.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }
    let candidates: Vec<Arc<Backend>> = healthy
        .into_iter()
        .filter(|b| b.has_tool(tool_name))
        .collect();
    if candidates.is_empty() {
        return Err(GatewayError::Routing {
            tool_name: tool_name.to_string(),
            reason: "no backend has capability for this tool".to_string(),
        });
    }
    let sorted = sort_by_priority(candidates);
    Ok(decision_from_sorted(
        sorted,
        "Backend has the required tool capability".to_string(),
        Strategy::Capability,
    ))
}

/// `route_by_path` — section 4.D. Candidate set is the healthy set with no
/// capability pre-filter (resolved Open Question #1).
pub fn route_by_path(tool_name: &str, backends: &[Arc<Backend>]) -> Result<RoutingDecision> {
    if backends.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }
    let healthy = healthy_candidates(backends);
    if healthy.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }

    let mut candidates_with_pattern: Vec<(Arc<Backend>, String)> = Vec::new();
    for backend in &healthy {
        for route in &backend.config.routes {
            if route.strategy != RouteStrategy::Path {
                continue;
            }
            if let Ok(pattern) = glob::Pattern::new(&route.pattern)
                && pattern.matches(tool_name)
            {
                candidates_with_pattern.push((Arc::clone(backend), route.pattern.clone()));
                break;
            }
        }
    }

    if candidates_with_pattern.is_empty() {
        return Err(GatewayError::Routing {
            tool_name: tool_name.to_string(),
            reason: "no path-based route found for this tool".to_string(),
        });
    }

    candidates_with_pattern.sort_by_key(|(b, _)| b.config.priority);
    let matched_pattern = candidates_with_pattern[0].1.clone();
    let sorted: Vec<Arc<Backend>> = candidates_with_pattern.into_iter().map(|(b, _)| b).collect();

    Ok(decision_from_sorted(
        sorted,
        format!("Matched path pattern '{matched_pattern}'"),
        Strategy::Path,
    ))
}

/// `route_by_fallback` — section 4.D. No capability filter.
pub fn route_by_fallback(tool_name: &str, backends: &[Arc<Backend>]) -> Result<RoutingDecision> {
    if backends.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }
    let healthy = healthy_candidates(backends);
    if healthy.is_empty() {
        return Err(GatewayError::NoHealthyBackends {
            tool_name: tool_name.to_string(),
        });
    }
    let sorted = sort_by_priority(healthy);
    let priority = sorted[0].config.priority;
    Ok(decision_from_sorted(
        sorted,
        format!("Using fallback chain (priority: {priority})"),
        Strategy::Fallback,
    ))
}

pub fn route(strategy: Strategy, tool_name: &str, backends: &[Arc<Backend>]) -> Result<RoutingDecision> {
    match strategy {
        Strategy::Capability => route_by_capability(tool_name, backends),
        Strategy::Path => route_by_path(tool_name, backends),
        Strategy::Fallback => route_by_fallback(tool_name, backends),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{BackendConfig, BackendSource, Route};
    use crate::domain::health::{CircuitBreakerSettings, HealthCheckSettings};

    fn backend(name: &str, priority: u32, tools: &[&str], routes: Vec<Route>) -> Arc<Backend> {
        let config = BackendConfig {
            name: name.to_string(),
            source: BackendSource::Http {
                url: format!("http://localhost/{name}"),
            },
            namespace: name.to_string(),
            priority,
            routes,
            health_check: HealthCheckSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            auto_start: false,
        };
        let b = Backend::new(config);
        b.update_capabilities(crate::domain::backend::Capabilities {
            tools: tools
                .iter()
                .map(|t| crate::domain::backend::CapabilityDescriptor {
                    name: t.to_string(),
                    description: None,
                })
                .collect(),
            resources: vec![],
            prompts: vec![],
        });
        Arc::new(b)
    }

    #[test]
    fn capability_tie_break_scenario() {
        // End-to-end scenario 1 (SPEC_FULL.md section 8).
        let a = backend("A", 10, &["foo", "bar"], vec![]);
        let b = backend("B", 5, &["foo"], vec![]);
        let decision = route_by_capability("foo", &[a, b]).unwrap();
        assert_eq!(decision.backend_name, "B");
        assert_eq!(decision.alternatives, vec!["A".to_string()]);
        assert_eq!(decision.strategy_used, Strategy::Capability);
    }

    #[test]
    fn path_routing_pattern_match_scenario() {
        // End-to-end scenario 2.
        let a = backend(
            "A",
            10,
            &["fetch_user"],
            vec![Route {
                pattern: "fetch_*".to_string(),
                strategy: RouteStrategy::Path,
                fallback_to: None,
            }],
        );
        let b = backend(
            "B",
            20,
            &["fetch_user"],
            vec![Route {
                pattern: "*".to_string(),
                strategy: RouteStrategy::Path,
                fallback_to: None,
            }],
        );
        let decision = route_by_path("fetch_user", &[a, b]).unwrap();
        assert_eq!(decision.backend_name, "A");
        assert!(decision.reason.contains("fetch_*"));
    }

    #[test]
    fn path_routing_ignores_capability() {
        let a = backend(
            "A",
            10,
            &[], // no declared tools at all
            vec![Route {
                pattern: "fetch_*".to_string(),
                strategy: RouteStrategy::Path,
                fallback_to: None,
            }],
        );
        let decision = route_by_path("fetch_user", &[a]).unwrap();
        assert_eq!(decision.backend_name, "A");
    }

    #[test]
    fn fallback_ignores_capability_and_routes() {
        let a = backend("A", 20, &[], vec![]);
        let b = backend("B", 5, &[], vec![]);
        let decision = route_by_fallback("anything", &[a, b]).unwrap();
        assert_eq!(decision.backend_name, "B");
        assert!(decision.reason.contains("priority: 5"));
    }

    #[test]
    fn capability_with_no_matching_tool_is_routing_error() {
        let a = backend("A", 10, &["bar"], vec![]);
        let err = route_by_capability("foo", &[a]).unwrap_err();
        assert!(matches!(err, GatewayError::Routing { .. }));
    }

    #[test]
    fn no_backends_at_all_is_no_healthy_backends() {
        let err = route_by_capability("foo", &[]).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackends { .. }));
    }

    #[test]
    fn unhealthy_backend_excluded_from_candidates() {
        let a = backend("A", 10, &["foo"], vec![]);
        a.record_failure("down");
        a.record_failure("down");
        a.record_failure("down");
        a.record_failure("down");
        a.record_failure("down"); // default failure_threshold = 5
        assert!(a.circuit_state() == crate::domain::health::CircuitState::Open);
        let err = route_by_capability("foo", &[a]).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackends { .. }));
    }

    #[test]
    fn circuit_open_blocker_names_sole_open_candidate() {
        // End-to-end scenario 3 (SPEC_FULL.md section 8): the only candidate
        // for this tool has its circuit open, so `call_tool` should short-
        // circuit to `CircuitBreakerOpen` before ever calling `route`.
        let a = backend("A", 10, &["foo"], vec![]);
        for _ in 0..5 {
            a.record_failure("down");
        }
        assert_eq!(circuit_open_blocker(&[a]), Some("A".to_string()));
    }

    #[test]
    fn circuit_open_blocker_silent_when_a_healthy_candidate_exists() {
        let a = backend("A", 10, &["foo"], vec![]);
        for _ in 0..5 {
            a.record_failure("down");
        }
        let b = backend("B", 20, &["foo"], vec![]);
        assert_eq!(circuit_open_blocker(&[a, b]), None);
    }

    #[test]
    fn circuit_open_blocker_silent_when_unhealthy_for_other_reasons() {
        let a = backend("A", 10, &["foo"], vec![]);
        a.record_failure("down"); // below failure_threshold, circuit stays closed
        assert_eq!(circuit_open_blocker(&[a]), None);
    }
}
