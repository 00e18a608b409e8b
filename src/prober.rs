//! Health Prober — section 4.H. One cooperative task per gateway: pings every
//! enabled backend on its own interval, drives circuit recovery through the
//! half-open state, and triggers a capability refresh once the cache TTL
//! expires.
//!
//! Grounded on the teacher's `run_health_checker` (`backend/health.rs`):
//! staggered pings spread across the check interval so not every backend is
//! probed in the same instant, generalized here to per-backend
//! `health_check.interval`/`enabled` settings instead of one global interval.
//! The task wakes on a fixed scheduling granularity (`tick_interval`, expected
//! to be finer than any configured per-backend interval) and on each tick
//! probes only the backends whose own `health_check.interval` has elapsed
//! since their last recorded check.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::client::BackendClient;
use crate::discovery::{discover_for_backend, needs_refresh};
use crate::domain::Backend;
use crate::registry::BackendRegistry;

pub struct ProberSettings {
    /// Upper bound on concurrently in-flight pings (section 4.H "at most
    /// concurrently-per-backend 1" — this additionally caps the fan-out
    /// across backends so a large registry doesn't open hundreds of sockets
    /// in the same tick).
    pub max_concurrent_pings: usize,
    pub capability_cache_ttl: Duration,
}

impl Default for ProberSettings {
    fn default() -> Self {
        Self {
            max_concurrent_pings: 16,
            capability_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Runs until `shutdown` resolves. Intended to be spawned as its own task by
/// the gateway's composition root.
pub async fn run(
    registry: Arc<BackendRegistry>,
    clients: Arc<DashMap<String, Arc<dyn BackendClient>>>,
    settings: ProberSettings,
    tick_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_pings));
    let mut interval = tokio::time::interval(tick_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                probe_all(&registry, &clients, &semaphore).await;
                refresh_stale_capabilities(&registry, &clients, settings.capability_cache_ttl).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("health prober shutting down");
                    break;
                }
            }
        }
    }
}

async fn probe_all(
    registry: &BackendRegistry,
    clients: &DashMap<String, Arc<dyn BackendClient>>,
    semaphore: &Arc<Semaphore>,
) {
    let backends = registry.all();
    let tasks = backends.into_iter().filter_map(|backend| {
        if !backend.config.health_check.enabled || !due_for_probe(&backend) {
            return None;
        }
        let client = clients.get(backend.name()).map(|e| Arc::clone(e.value()))?;
        let semaphore = Arc::clone(semaphore);
        Some(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            probe_one(&backend, client.as_ref()).await;
        })
    });

    futures_util::future::join_all(tasks).await;
}

/// Whether `backend`'s own `health_check.interval` has elapsed since its
/// last recorded check — the per-backend interval this module's generalized
/// over a single global scheduling tick.
fn due_for_probe(backend: &Backend) -> bool {
    match backend.with_health(|h| h.last_check) {
        Some(last) => last.elapsed() >= backend.config.health_check.interval,
        None => true,
    }
}

/// `record_success`/`record_failure`, plus half-open circuit recovery
/// (section 4.C transition table, driven here rather than by the caller of
/// `call_tool` since recovery happens independent of traffic). The ping
/// itself is bounded by the backend's own `health_check.timeout`.
async fn probe_one(backend: &Arc<Backend>, client: &dyn BackendClient) {
    if backend.should_attempt_half_open() {
        backend.enter_half_open();
        debug!(backend = backend.name(), "circuit entering half-open for probe");
    }

    let healthy = tokio::time::timeout(backend.config.health_check.timeout, client.ping())
        .await
        .unwrap_or(false);
    let was_half_open = backend.circuit_state() == crate::domain::health::CircuitState::HalfOpen;

    if healthy {
        if was_half_open {
            backend.record_half_open_success();
        } else {
            backend.record_success();
        }
    } else {
        backend.record_failure("health ping failed");
    }
}

async fn refresh_stale_capabilities(
    registry: &BackendRegistry,
    clients: &DashMap<String, Arc<dyn BackendClient>>,
    cache_ttl: Duration,
) {
    let stale: Vec<_> = registry
        .all()
        .into_iter()
        .filter(|b| needs_refresh(b, cache_ttl))
        .collect();

    if stale.is_empty() {
        return;
    }

    let tasks = stale.into_iter().filter_map(|backend| {
        let client = clients.get(backend.name()).map(|e| Arc::clone(e.value()))?;
        Some(async move {
            discover_for_backend(&backend, client.as_ref()).await;
        })
    });

    futures_util::future::join_all(tasks).await;
}
