//! Composition root — section 6. Wires the registry, clients, reconciler,
//! and the background prober/watcher tasks into the six gateway-facing
//! operations.
//!
//! Grounded on the teacher's `BackendManager`/`InitializedGateway` shape: a
//! single struct owning every shared component, an atomic in-flight-call
//! counter, and a `shutdown`/drain sequence modeled on `stop_all`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::{BackendClient, HttpBackendClient};
use crate::config::Config;
use crate::discovery::discover_for_backend;
use crate::domain::backend::BackendConfig;
use crate::domain::backend::BackendSource;
use crate::domain::health::CircuitState;
use crate::domain::routing::Strategy;
use crate::domain::Backend;
use crate::error::{GatewayError, Result};
use crate::invocation::{self, InvocationOutcome};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::BackendRegistry;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Serialize)]
pub struct BackendSummary {
    pub name: String,
    pub url: String,
    pub namespace: String,
    pub priority: u32,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub error_count: u32,
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterBackendResponse {
    pub backend_name: String,
    pub namespace: String,
    pub url: String,
    pub started: bool,
    pub message: String,
}

/// Guard drop-decrements the shared in-flight counter (section 5 "Graceful
/// shutdown"). Grounded on the teacher's `CallGuard`.
struct CallGuard(Arc<AtomicUsize>);

impl CallGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Gateway {
    registry: Arc<BackendRegistry>,
    clients: Arc<DashMap<String, Arc<dyn BackendClient>>>,
    supervisor: Arc<ProcessSupervisor>,
    config: Arc<arc_swap::ArcSwap<Config>>,
    in_flight_calls: Arc<AtomicUsize>,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(BackendRegistry::new()),
            clients: Arc::new(DashMap::new()),
            supervisor: Arc::new(ProcessSupervisor::new()),
            config: Arc::new(arc_swap::ArcSwap::from_pointee(config)),
            in_flight_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn clients(&self) -> &Arc<DashMap<String, Arc<dyn BackendClient>>> {
        &self.clients
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler {
            registry: Arc::clone(&self.registry),
            clients: Arc::clone(&self.clients),
            supervisor: Arc::clone(&self.supervisor),
            request_timeout: self.config.load().request_timeout,
        }
    }

    /// Registers every backend listed in the current config. Called once at
    /// startup before the prober/watcher tasks are spawned.
    pub async fn start_all(&self) -> Result<()> {
        let backends = self.config.load().backends.clone();
        let reconciler = self.reconciler();
        for config in backends {
            let name = config.name.clone();
            if let Err(e) = reconciler.register(config).await {
                warn!(backend = name, error = %e, "failed to register backend at startup");
            }
        }
        Ok(())
    }

    /// `call_tool` — section 6.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        strategy: Option<Strategy>,
    ) -> Result<InvocationOutcome> {
        let _guard = CallGuard::new(&self.in_flight_calls);
        let config = self.config.load();
        let retry = config.retry;
        let enable_namespaces = config.enable_namespaces;
        invocation::call_tool(
            &self.registry,
            &self.clients,
            &retry,
            tool_name,
            arguments,
            strategy,
            enable_namespaces,
        )
        .await
    }

    /// `list_backends` — section 6.
    pub fn list_backends(&self) -> Vec<BackendSummary> {
        self.registry
            .all()
            .iter()
            .map(|b| BackendSummary {
                name: b.name().to_string(),
                url: b.base_url(),
                namespace: b.config.namespace.clone(),
                priority: b.config.priority,
                healthy: b.is_healthy(),
                circuit_state: b.circuit_state(),
                error_count: b.with_health(|h| h.error_count),
            })
            .collect()
    }

    /// `get_backend_health` — section 6.
    pub fn get_backend_health(&self, name: &str) -> Result<BackendHealth> {
        let backend = self.registry.get(name)?;
        Ok(BackendHealth {
            name: backend.name().to_string(),
            healthy: backend.is_healthy(),
            circuit_state: backend.circuit_state(),
            error_count: backend.with_health(|h| h.error_count),
            last_error: backend.with_health(|h| h.last_error.clone()),
        })
    }

    /// `register_backend` — section 6. Parses the source grammar, derives
    /// namespace/name when not given explicitly, and runs the full
    /// onboarding sequence via the reconciler.
    pub async fn register_backend(
        &self,
        source: &str,
        name: Option<String>,
        namespace: Option<String>,
        priority: Option<u32>,
        auto_start: Option<bool>,
        health_check_enabled: Option<bool>,
    ) -> Result<RegisterBackendResponse> {
        let parsed_source = BackendSource::parse(source)?;
        let namespace = match namespace {
            Some(ns) => ns,
            None => parsed_source.derive_namespace()?,
        };
        let name = match name {
            Some(n) => n,
            None => parsed_source.derive_name()?,
        };

        let mut health_check = crate::domain::health::HealthCheckSettings::default();
        if let Some(enabled) = health_check_enabled {
            health_check.enabled = enabled;
        }

        let config = BackendConfig {
            name: name.clone(),
            source: parsed_source,
            namespace: namespace.clone(),
            priority: priority.unwrap_or(10),
            routes: vec![],
            health_check,
            circuit_breaker: crate::domain::health::CircuitBreakerSettings::default(),
            auto_start: auto_start.unwrap_or(true),
        };
        config.validate()?;

        let started = config.auto_start && config.source.process_config().is_some();
        self.reconciler().register(config).await?;
        let url = self.registry.get(&name)?.base_url();

        Ok(RegisterBackendResponse {
            backend_name: name.clone(),
            namespace,
            url,
            started,
            message: format!("Backend '{name}' registered successfully"),
        })
    }

    /// `unregister_backend` — section 6.
    pub async fn unregister_backend(&self, name: &str) -> Result<()> {
        self.reconciler().deregister(name).await
    }

    /// `reload_config` — section 6. Re-reads the config file from disk,
    /// diffs it against the live config, and reconciles.
    pub async fn reload_config(&self, config_path: &std::path::Path) -> Result<ReconcileReport> {
        let new_config = Config::load(config_path)?;
        let old_config = self.config.load_full();
        let diff = old_config.diff_backends(&new_config);
        self.config.store(Arc::new(new_config));
        Ok(self.reconciler().reconcile(diff).await)
    }

    /// Graceful shutdown — section 5. Blocks new backend lookups aren't
    /// needed (the registry stays queryable up to the moment processes are
    /// killed), drains in-flight calls up to `drain_timeout`, then stops
    /// every supervised process. Grounded on the teacher's `stop_all`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let drain_start = tokio::time::Instant::now();
        loop {
            let in_flight = self.in_flight_calls.load(Ordering::SeqCst);
            if in_flight == 0 {
                break;
            }
            if drain_start.elapsed() > drain_timeout {
                warn!(in_flight, "drain timeout, forcing shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("all in-flight calls drained (or timed out), stopping processes");
        self.supervisor.shutdown_all().await;
    }

    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn config_arc(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// The shared config cell itself — handed to the file watcher so a
    /// hot-reload updates the same store `call_tool`/`reconciler()` read
    /// from, rather than a disconnected copy.
    pub fn config_swap(&self) -> Arc<arc_swap::ArcSwap<Config>> {
        Arc::clone(&self.config)
    }
}

/// Refreshes a single backend's capabilities on demand — exposed for the
/// admin surface's manual-refresh affordance.
pub async fn refresh_backend(backend: &Arc<Backend>, client: &dyn BackendClient) {
    discover_for_backend(backend, client).await;
}
