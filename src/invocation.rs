//! Routed invocation — section 4.G. The operation the rest of the crate
//! exists to support: resolve a tool name to a backend, call it, retry with
//! backoff on transport failure.
//!
//! Grounded on the teacher's `BackendManager::call_tool` retry loop
//! (`backend/mod.rs`), generalized from the teacher's fixed `RETRY_DELAYS`
//! table to the reference implementation's configurable exponential backoff
//! (`route_tool_call.py`: sleep before multiplying, not after).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::client::BackendClient;
use crate::domain::health::CircuitState;
use crate::domain::routing::{self, RoutingDecision, Strategy};
use crate::domain::Backend;
use crate::error::{GatewayError, Result};
use crate::registry::BackendRegistry;

/// `RetrySettings` — section 4.G defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(default = "default_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_retry_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            retry_backoff_multiplier: default_multiplier(),
            max_retry_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> Duration {
    Duration::from_secs_f64(1.0)
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub result: Value,
    pub backend_name: String,
    pub strategy_used: Strategy,
}

/// `call_tool` — section 4.G. `strategy` defaults to `Capability` when unset.
///
/// When `enable_namespaces` is set and `tool_name` carries a
/// `"<namespace>.<original>"` prefix (section 6 "Namespacing of proxied
/// names"), the namespace addresses its backend directly and the usual
/// strategy-based disambiguation is skipped entirely — namespacing exists
/// precisely to make that disambiguation unnecessary.
pub async fn call_tool(
    registry: &BackendRegistry,
    clients: &DashMap<String, Arc<dyn BackendClient>>,
    retry: &RetrySettings,
    tool_name: &str,
    arguments: Value,
    strategy: Option<Strategy>,
    enable_namespaces: bool,
) -> Result<InvocationOutcome> {
    let strategy = strategy.unwrap_or_default();

    if enable_namespaces
        && let Some((namespace, original_name)) = crate::domain::namespace::split_namespaced(tool_name)
        && let Some(backend) = registry.all().into_iter().find(|b| b.config.namespace == namespace)
    {
        return call_on_backend(backend, clients, retry, original_name, arguments, strategy).await;
    }

    let candidates = match strategy {
        Strategy::Path => registry.healthy(),
        _ => registry.with_tool(tool_name),
    };

    if let Some(backend_name) = routing::circuit_open_blocker(&candidates) {
        return Err(GatewayError::CircuitBreakerOpen { backend_name });
    }

    let decision = routing::route(strategy, tool_name, &candidates)?;
    let backend = registry.get(&decision.backend_name)?;
    call_on_backend(backend, clients, retry, tool_name, arguments, decision.strategy_used).await
}

/// Shared tail of `call_tool`: circuit check, client lookup, retry loop.
/// `strategy_used` is echoed back on the outcome as-is — the namespaced
/// direct-addressing path reports the strategy the caller asked for (or its
/// default) since no strategy-based disambiguation actually ran.
async fn call_on_backend(
    backend: Arc<Backend>,
    clients: &DashMap<String, Arc<dyn BackendClient>>,
    retry: &RetrySettings,
    tool_name: &str,
    arguments: Value,
    strategy_used: Strategy,
) -> Result<InvocationOutcome> {
    if backend.circuit_state() == CircuitState::Open {
        return Err(GatewayError::CircuitBreakerOpen {
            backend_name: backend.name().to_string(),
        });
    }

    let client = clients
        .get(backend.name())
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| GatewayError::BackendNotFound(backend.name().to_string()))?;

    let backend_name = backend.name().to_string();
    let result = retry_call(backend.as_ref(), client.as_ref(), retry, tool_name, arguments).await?;

    Ok(InvocationOutcome {
        result,
        backend_name,
        strategy_used,
    })
}

/// Retry loop — section 4.G step 6/7. Only ever called on a backend whose
/// circuit was CLOSED at the start of the invocation; a failure mid-loop may
/// still open the circuit (via `record_failure`), but this loop itself does
/// not re-check circuit state between attempts — that's the prober's job.
async fn retry_call(
    backend: &Backend,
    client: &dyn BackendClient,
    retry: &RetrySettings,
    tool_name: &str,
    arguments: Value,
) -> Result<Value> {
    let mut backoff = retry.initial_backoff;
    let mut last_err = None;

    for attempt in 0..retry.max_retry_attempts {
        match client.call_tool(tool_name, arguments.clone()).await {
            Ok(result) => {
                backend.record_success();
                return Ok(result);
            }
            Err(err) => {
                warn!(backend = backend.name(), attempt, error = %err, "tool call failed");
                backend.record_failure(err.to_string());
                let retryable = err.is_retryable();
                last_err = Some(err);
                let is_last_attempt = attempt + 1 == retry.max_retry_attempts;
                if !retryable || is_last_attempt {
                    break;
                }
                tokio::time::sleep(backoff.min(retry.max_retry_backoff)).await;
                backoff = Duration::from_secs_f64(backoff.as_secs_f64() * retry.retry_backoff_multiplier);
            }
        }
    }

    Err(match last_err {
        Some(GatewayError::Transport { backend_name, source }) => {
            GatewayError::Transport { backend_name, source }
        }
        Some(other) => GatewayError::Transport {
            backend_name: backend.name().to_string(),
            source: anyhow::anyhow!(other.to_string()),
        },
        None => GatewayError::Transport {
            backend_name: backend.name().to_string(),
            source: anyhow::anyhow!("exhausted retries with no recorded error"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{BackendConfig, BackendSource};
    use crate::domain::health::{CircuitBreakerSettings, HealthCheckSettings};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyClient {
        failures_before_success: u32,
        calls: AtomicU32,
        requested_arguments: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl BackendClient for FlakyClient {
        async fn list_tools(&self) -> Result<Vec<crate::domain::backend::CapabilityDescriptor>> {
            Ok(vec![])
        }
        async fn list_resources(&self) -> Result<Vec<crate::domain::backend::ResourceDescriptor>> {
            Ok(vec![])
        }
        async fn list_prompts(&self) -> Result<Vec<crate::domain::backend::CapabilityDescriptor>> {
            Ok(vec![])
        }
        async fn call_tool(&self, _tool_name: &str, arguments: Value) -> Result<Value> {
            self.requested_arguments.lock().unwrap().push(arguments);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(GatewayError::Transport {
                    backend_name: "flaky".to_string(),
                    source: anyhow::anyhow!("simulated failure"),
                })
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
        async fn get_resource(&self, _uri: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn ping(&self) -> bool {
            true
        }
    }

    fn backend(name: &str, tools: &[&str]) -> Arc<Backend> {
        let b = Backend::new(BackendConfig {
            name: name.to_string(),
            source: BackendSource::Http {
                url: format!("http://localhost/{name}"),
            },
            namespace: name.to_string(),
            priority: 10,
            routes: vec![],
            health_check: HealthCheckSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            auto_start: false,
        });
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

    #[tokio::test]
    async fn retries_then_succeeds() {
        let registry = BackendRegistry::new();
        let b = backend("flaky", &["foo"]);
        registry.add(Arc::clone(&b)).unwrap();

        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        clients.insert(
            "flaky".to_string(),
            Arc::new(FlakyClient {
                failures_before_success: 2,
                calls: AtomicU32::new(0),
                requested_arguments: Mutex::new(vec![]),
            }),
        );

        let retry = RetrySettings {
            initial_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(5),
            ..Default::default()
        };

        let outcome = call_tool(&registry, &clients, &retry, "foo", serde_json::json!({}), None, false)
            .await
            .unwrap();
        assert_eq!(outcome.backend_name, "flaky");
        assert_eq!(outcome.result, serde_json::json!({"ok": true}));
        assert!(b.is_healthy());
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_without_calling_client() {
        let registry = BackendRegistry::new();
        let b = backend("down", &["foo"]);
        for _ in 0..5 {
            b.record_failure("boom");
        }
        registry.add(Arc::clone(&b)).unwrap();

        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        clients.insert(
            "down".to_string(),
            Arc::new(FlakyClient {
                failures_before_success: 0,
                calls: AtomicU32::new(0),
                requested_arguments: Mutex::new(vec![]),
            }),
        );

        let retry = RetrySettings::default();
        let err = call_tool(&registry, &clients, &retry, "foo", serde_json::json!({}), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitBreakerOpen { .. }));
    }

    #[tokio::test]
    async fn no_capability_is_routing_error_not_transport() {
        let registry = BackendRegistry::new();
        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        let retry = RetrySettings::default();
        let err = call_tool(&registry, &clients, &retry, "foo", serde_json::json!({}), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackends { .. }));
    }

    #[tokio::test]
    async fn namespaced_call_addresses_its_backend_directly() {
        let registry = BackendRegistry::new();
        // Two backends both expose "generate"; without namespacing this would
        // be a capability-routing tie. The namespace prefix picks "reports"
        // even though "other" has higher priority (lower number).
        let reports = backend("reports", &["generate"]);
        let other = Backend::new(BackendConfig {
            name: "other".to_string(),
            source: BackendSource::Http {
                url: "http://localhost/other".to_string(),
            },
            namespace: "other".to_string(),
            priority: 1,
            routes: vec![],
            health_check: HealthCheckSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            auto_start: false,
        });
        other.update_capabilities(crate::domain::backend::Capabilities {
            tools: vec![crate::domain::backend::CapabilityDescriptor {
                name: "generate".to_string(),
                description: None,
            }],
            resources: vec![],
            prompts: vec![],
        });
        registry.add(Arc::clone(&reports)).unwrap();
        registry.add(Arc::new(other)).unwrap();

        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        clients.insert(
            "reports".to_string(),
            Arc::new(FlakyClient {
                failures_before_success: 0,
                calls: AtomicU32::new(0),
                requested_arguments: Mutex::new(vec![]),
            }),
        );

        let retry = RetrySettings::default();
        let outcome = call_tool(
            &registry,
            &clients,
            &retry,
            "reports.generate",
            serde_json::json!({}),
            None,
            true,
        )
        .await
        .unwrap();
        assert_eq!(outcome.backend_name, "reports");
    }

    #[tokio::test]
    async fn namespacing_disabled_ignores_dotted_prefix_and_routes_by_priority() {
        let registry = BackendRegistry::new();
        let b = backend("flaky", &["foo"]);
        registry.add(Arc::clone(&b)).unwrap();
        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        clients.insert(
            "flaky".to_string(),
            Arc::new(FlakyClient {
                failures_before_success: 0,
                calls: AtomicU32::new(0),
                requested_arguments: Mutex::new(vec![]),
            }),
        );

        let retry = RetrySettings::default();
        // With namespacing disabled, "flaky.foo" is treated as a literal (and
        // unknown) tool name, not split into namespace + original.
        let err = call_tool(&registry, &clients, &retry, "flaky.foo", serde_json::json!({}), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackends { .. }));
    }
}
