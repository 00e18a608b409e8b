//! Reconciler — section 4.K. Turns a `ConfigDiff` into registry/process
//! operations: added backends are started and registered, removed backends
//! are deregistered and their processes stopped, changed backends are
//! replaced via remove-then-add.
//!
//! Grounded on the reference implementation's `RegisterBackend` use case for
//! the registration sequence (allocate port → start process → wait for
//! readiness → discover capabilities → add to registry) and its
//! `_wait_for_ready` poll loop (`GET {url}/health` once a second, up to a
//! timeout, any status below 500 counts as ready).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::client::{BackendClient, HttpBackendClient};
use crate::config::ConfigDiff;
use crate::discovery::discover_for_backend;
use crate::domain::backend::BackendConfig;
use crate::domain::Backend;
use crate::error::{GatewayError, Result};
use crate::registry::BackendRegistry;
use crate::supervisor::ProcessSupervisor;

/// Outcome of one reconciliation pass — reported back to the caller (and,
/// via the admin surface, to an operator) rather than raised as a single
/// all-or-nothing error, since a partial reconcile is still useful.
#[derive(Debug, Default, serde::Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub errors: Vec<String>,
}

pub struct Reconciler {
    pub registry: Arc<BackendRegistry>,
    pub clients: Arc<DashMap<String, Arc<dyn BackendClient>>>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub request_timeout: Duration,
}

impl Reconciler {
    /// `reconcile` — section 4.K. Applies additions, removals, and changes
    /// independently; one backend's failure does not abort the others.
    pub async fn reconcile(&self, diff: ConfigDiff) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for name in diff.removed {
            match self.deregister(&name).await {
                Ok(()) => report.removed.push(name),
                Err(e) => report.errors.push(format!("remove '{name}': {e}")),
            }
        }

        for config in diff.changed {
            let name = config.name.clone();
            if let Err(e) = self.deregister(&name).await {
                report.errors.push(format!("update '{name}' (remove phase): {e}"));
                continue;
            }
            match self.register(config).await {
                Ok(()) => report.updated.push(name),
                Err(e) => report.errors.push(format!("update '{name}' (add phase): {e}")),
            }
        }

        for config in diff.added {
            let name = config.name.clone();
            match self.register(config).await {
                Ok(()) => report.added.push(name),
                Err(e) => report.errors.push(format!("add '{name}': {e}")),
            }
        }

        report
    }

    /// `register` — one backend's full onboarding sequence. Grounded on
    /// `RegisterBackend.execute`: start the process if this backend manages
    /// one and `auto_start` is set, wait for it to answer `/health`, build a
    /// client, discover capabilities, and only then add it to the registry
    /// (a backend never appears to routing before it has a client and has
    /// been probed at least once).
    pub async fn register(&self, config: BackendConfig) -> Result<()> {
        if self.registry.exists(&config.name) {
            return Err(GatewayError::BackendAlreadyExists(config.name));
        }

        let (base_url, allocated_port) = self.resolve_base_url(&config).await?;

        let client: Arc<dyn BackendClient> =
            Arc::new(HttpBackendClient::new(base_url, self.request_timeout)?);

        let backend = Arc::new(Backend::new(config));
        if let Some(port) = allocated_port {
            backend.set_process(self.supervisor.pid(backend.name()), Some(port));
        }
        discover_for_backend(&backend, client.as_ref()).await;

        self.clients.insert(backend.name().to_string(), client);
        self.registry.add(backend)?;
        Ok(())
    }

    /// Resolves this backend's base URL, starting its process first when the
    /// source is process-backed. Returns the port the process was started on
    /// so the caller can record it onto the `Backend` (section 3 "process-id
    /// when locally supervised").
    async fn resolve_base_url(&self, config: &BackendConfig) -> Result<(String, Option<u16>)> {
        use crate::domain::backend::BackendSource;

        match &config.source {
            BackendSource::Http { url } => Ok((url.clone(), None)),
            BackendSource::Github { process, .. } | BackendSource::Package { process, .. } => {
                if !config.auto_start {
                    return Err(GatewayError::InvalidConfiguration(format!(
                        "backend '{}': process-backed source requires auto_start or an explicit url",
                        config.name
                    )));
                }
                let port = self.supervisor.start_process(&config.name, process.clone()).await?;
                let url = format!("http://127.0.0.1:{port}");
                self.wait_for_ready(&url, Duration::from_secs(30)).await?;
                Ok((url, Some(port)))
            }
        }
    }

    /// `_wait_for_ready` — polls `{url}/health` once a second until a
    /// sub-500 status is observed or `timeout` elapses.
    async fn wait_for_ready(&self, url: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let http = reqwest::Client::new();
        loop {
            if let Ok(response) = http
                .get(format!("{url}/health"))
                .timeout(Duration::from_secs(1))
                .send()
                .await
            {
                if response.status().as_u16() < 500 {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::ProcessManagement(format!(
                    "backend at {url} did not become ready within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// `deregister` — idempotent: removing an already-absent backend is not
    /// an error at this layer (section 3 "Client map... idempotent
    /// remove-if-present").
    pub async fn deregister(&self, name: &str) -> Result<()> {
        self.clients.remove(name);
        if let Err(e) = self.supervisor.stop_process(name).await {
            warn!(backend = name, error = %e, "error stopping process during deregister");
        }
        match self.registry.remove(name) {
            Ok(_) => {
                info!(backend = name, "backend deregistered");
                Ok(())
            }
            Err(GatewayError::BackendNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
