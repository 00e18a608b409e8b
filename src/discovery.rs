//! Capability discovery — section 4.F. Populates a backend's `tools`,
//! `resources`, and `prompts` from its client, and advances the staleness
//! clock used by the health prober's refresh-on-demand check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::BackendClient;
use crate::domain::backend::Capabilities;
use crate::domain::Backend;

/// `discover_for_backend` — section 4.F. Used standalone during registration
/// and as the unit of work `discover_all` fans out concurrently.
pub async fn discover_for_backend(backend: &Arc<Backend>, client: &dyn BackendClient) {
    let tools = client.list_tools().await;
    let resources = client.list_resources().await;
    let prompts = client.list_prompts().await;

    match (tools, resources, prompts) {
        (Ok(tools), Ok(resources), Ok(prompts)) => {
            let tool_count = tools.len();
            backend.update_capabilities(Capabilities {
                tools,
                resources,
                prompts,
            });
            backend.record_success();
            info!(backend = backend.name(), tools = tool_count, "discovered capabilities");
        }
        (tools, resources, prompts) => {
            let reason = [tools.err(), resources.err(), prompts.err()]
                .into_iter()
                .flatten()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown discovery failure".to_string());
            warn!(backend = backend.name(), error = %reason, "capability discovery failed");
            backend.record_failure(reason);
        }
    }
}

/// `discover_all` — section 4.F. Runs one discovery pass per backend
/// concurrently; backends that fail stay in the registry with their previous
/// (possibly stale) capabilities and a recorded failure.
pub async fn discover_all(
    backends: &[Arc<Backend>],
    clients: &dashmap::DashMap<String, Arc<dyn BackendClient>>,
) {
    let futures = backends.iter().filter_map(|backend| {
        clients
            .get(backend.name())
            .map(|client| (Arc::clone(backend), Arc::clone(client.value())))
    });

    let tasks: Vec<_> = futures
        .map(|(backend, client)| async move {
            discover_for_backend(&backend, client.as_ref()).await;
        })
        .collect();

    futures_util::future::join_all(tasks).await;
}

/// Whether `backend`'s capabilities should be refreshed given `cache_ttl`
/// (section 4.F "TTL refresh").
pub fn needs_refresh(backend: &Backend, cache_ttl: Duration) -> bool {
    backend.capabilities_stale(cache_ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{BackendConfig, BackendSource, CapabilityDescriptor, ResourceDescriptor};
    use crate::domain::health::{CircuitBreakerSettings, HealthCheckSettings};
    use crate::error::{GatewayError, Result as GResult};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use serde_json::Value;

    struct FakeClient {
        fail: bool,
    }

    #[async_trait]
    impl BackendClient for FakeClient {
        async fn list_tools(&self) -> GResult<Vec<CapabilityDescriptor>> {
            if self.fail {
                return Err(GatewayError::Transport {
                    backend_name: "x".to_string(),
                    source: anyhow::anyhow!("down"),
                });
            }
            Ok(vec![CapabilityDescriptor {
                name: "generate".to_string(),
                description: None,
            }])
        }
        async fn list_resources(&self) -> GResult<Vec<ResourceDescriptor>> {
            Ok(vec![])
        }
        async fn list_prompts(&self) -> GResult<Vec<CapabilityDescriptor>> {
            Ok(vec![])
        }
        async fn call_tool(&self, _tool_name: &str, _arguments: Value) -> GResult<Value> {
            unimplemented!()
        }
        async fn get_resource(&self, _uri: &str) -> GResult<String> {
            Ok(String::new())
        }
        async fn ping(&self) -> bool {
            !self.fail
        }
    }

    fn backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend::new(BackendConfig {
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
        }))
    }

    #[tokio::test]
    async fn successful_discovery_populates_capabilities_and_records_success() {
        let b = backend("db");
        discover_for_backend(&b, &FakeClient { fail: false }).await;
        assert!(b.has_tool("generate"));
        assert!(b.is_healthy());
        assert!(!needs_refresh(&b, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn failed_discovery_keeps_stale_capabilities_and_records_failure() {
        let b = backend("db");
        discover_for_backend(&b, &FakeClient { fail: false }).await;
        assert!(b.has_tool("generate"));

        discover_for_backend(&b, &FakeClient { fail: true }).await;
        // capabilities untouched by the failed pass
        assert!(b.has_tool("generate"));
        assert!(!b.is_healthy());
    }

    #[tokio::test]
    async fn discover_all_fans_out_across_backends_missing_a_client_is_skipped() {
        let a = backend("a");
        let b = backend("b");
        let clients: DashMap<String, Arc<dyn BackendClient>> = DashMap::new();
        clients.insert("a".to_string(), Arc::new(FakeClient { fail: false }));
        // "b" has no registered client and must be skipped without panicking.

        discover_all(&[Arc::clone(&a), Arc::clone(&b)], &clients).await;

        assert!(a.has_tool("generate"));
        assert!(!b.has_tool("generate"));
    }

    #[test]
    fn capabilities_stale_with_no_prior_refresh() {
        let b = backend("db");
        assert!(needs_refresh(&b, Duration::from_secs(60)));
    }
}
