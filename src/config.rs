//! Desired-state configuration — section 6. A YAML file listing backends,
//! loaded, validated, and hot-reloaded via a file watcher; a `Reconciler`
//! (`reconciler.rs`) turns a diff between the old and new config into
//! registry/process operations.
//!
//! Grounded on the teacher's `config.rs`: the `humantime_duration` serde
//! module (kept byte-for-byte — every other module's `with = "crate::config::
//! humantime_duration"` attribute depends on this exact path), the
//! `Config::load` read→shellexpand→deserialize→validate pipeline (minus
//! secret resolution, which has no counterpart here), `ConfigDiff`/
//! `diff_backends`, and `watch_config`'s notify-based 500ms-debounced watch
//! loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::backend::{BackendConfig, BackendSource};
use crate::error::{GatewayError, Result};
use crate::invocation::RetrySettings;

/// Environment variables that override config-file values (section 6).
pub mod env_overrides {
    pub const BACKENDS_CONFIG: &str = "MCP_BACKENDS_CONFIG";
    pub const DEFAULT_STRATEGY: &str = "MCP_DEFAULT_STRATEGY";
    pub const ENABLE_NAMESPACES: &str = "MCP_ENABLE_NAMESPACES";
    pub const CACHE_TTL: &str = "MCP_CACHE_TTL";
    pub const REQUEST_TIMEOUT: &str = "MCP_REQUEST_TIMEOUT";
    pub const HEALTH_CHECK_INTERVAL: &str = "MCP_HEALTH_CHECK_INTERVAL";
    pub const HEALTH_CHECK_TIMEOUT: &str = "MCP_HEALTH_CHECK_TIMEOUT";
    pub const MAX_RETRIES: &str = "MCP_MAX_RETRIES";
    pub const RETRY_BACKOFF: &str = "MCP_RETRY_BACKOFF";
    pub const MAX_BACKOFF: &str = "MCP_MAX_BACKOFF";
}

/// Top-level gateway configuration (section 6 "desired-state file format").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_strategy")]
    pub default_strategy: crate::domain::routing::Strategy,

    #[serde(default = "default_true")]
    pub enable_namespaces: bool,

    #[serde(default = "default_cache_ttl", with = "humantime_duration")]
    pub cache_ttl: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub admin_listen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_strategy: default_strategy(),
            enable_namespaces: default_true(),
            cache_ttl: default_cache_ttl(),
            request_timeout: default_request_timeout(),
            retry: RetrySettings::default(),
            backends: Vec::new(),
            admin_listen: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_strategy() -> crate::domain::routing::Strategy {
    crate::domain::routing::Strategy::Capability
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

// --- humantime_duration serde helper ---
// Kept identical to the teacher's: every `CircuitBreakerSettings`,
// `HealthCheckSettings`, and this module's own `Duration` fields serialize
// as "30s"/"5m"/"1h" through this exact path.
pub mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn format_duration(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(3600) && secs >= 3600 {
            format!("{}h", secs / 3600)
        } else if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>().map(Duration::from_secs).map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected a format like '30s', '5m', '1h'")
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn formats_seconds_minutes_hours() {
            assert_eq!(format_duration(&Duration::from_secs(45)), "45s");
            assert_eq!(format_duration(&Duration::from_secs(120)), "2m");
            assert_eq!(format_duration(&Duration::from_secs(7200)), "2h");
        }

        #[test]
        fn parses_seconds_minutes_hours() {
            assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
            assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
            assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_duration("soon").is_err());
        }
    }
}

impl Config {
    /// `Config::load` — section 6. Pipeline: read file → `${VAR}` env
    /// interpolation → YAML deserialize → apply env-var overrides → validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfiguration(format!("failed to read {}: {e}", path.display()))
        })?;

        let expanded = shellexpand::env(&raw).map_err(|e| {
            GatewayError::InvalidConfiguration(format!("env var interpolation failed: {e}"))
        })?;

        let mut config: Config = serde_yaml_ng::from_str(&expanded).map_err(|e| {
            GatewayError::InvalidConfiguration(format!("failed to parse {}: {e}", path.display()))
        })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        use env_overrides::*;

        if let Ok(v) = std::env::var(DEFAULT_STRATEGY) {
            if let Ok(strategy) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.default_strategy = strategy;
            } else {
                tracing::warn!(value = %v, "ignoring unrecognized {DEFAULT_STRATEGY}");
            }
        }
        if let Ok(v) = std::env::var(ENABLE_NAMESPACES) {
            if let Ok(b) = v.parse() {
                self.enable_namespaces = b;
            }
        }
        if let Ok(v) = std::env::var(CACHE_TTL) {
            if let Ok(secs) = v.parse() {
                self.cache_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var(REQUEST_TIMEOUT) {
            if let Ok(secs) = v.parse() {
                self.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var(HEALTH_CHECK_INTERVAL) {
            if let Ok(secs) = v.parse::<u64>() {
                let interval = Duration::from_secs(secs);
                for backend in &mut self.backends {
                    if backend.health_check.interval == crate::domain::health::default_interval_for_env_override() {
                        backend.health_check.interval = interval;
                    }
                }
            }
        }
        if let Ok(v) = std::env::var(HEALTH_CHECK_TIMEOUT) {
            if let Ok(secs) = v.parse::<u64>() {
                let timeout = Duration::from_secs(secs);
                for backend in &mut self.backends {
                    if backend.health_check.timeout == crate::domain::health::default_timeout_for_env_override() {
                        backend.health_check.timeout = timeout;
                    }
                }
            }
        }
        if let Ok(v) = std::env::var(MAX_RETRIES) {
            if let Ok(n) = v.parse() {
                self.retry.max_retry_attempts = n;
            }
        }
        if let Ok(v) = std::env::var(RETRY_BACKOFF) {
            if let Ok(m) = v.parse() {
                self.retry.retry_backoff_multiplier = m;
            }
        }
        if let Ok(v) = std::env::var(MAX_BACKOFF) {
            if let Ok(secs) = v.parse::<u64>() {
                self.retry.max_retry_backoff = Duration::from_secs(secs);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen_names = std::collections::HashSet::new();
        let mut seen_namespaces = std::collections::HashSet::new();

        for backend in &self.backends {
            backend.validate()?;
            if !seen_names.insert(&backend.name) {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if !seen_namespaces.insert(&backend.namespace) {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "duplicate namespace '{}'",
                    backend.namespace
                )));
            }
            if matches!(backend.source, BackendSource::Http { .. }) && backend.namespace.is_empty() {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "backend '{}': http-only backends require an explicit namespace",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    /// Writes the config back out as YAML, atomically (temp file + rename),
    /// preserving the field order callers expect to see on disk.
    pub fn save(&self, path: &Path) -> AnyhowResult<()> {
        let yaml = serde_yaml_ng::to_string(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, yaml)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }
}

/// Diff between old and new configs — section 4.K.
pub struct ConfigDiff {
    pub added: Vec<BackendConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<BackendConfig>,
}

impl Config {
    pub fn diff_backends(&self, new: &Config) -> ConfigDiff {
        let old_by_name: HashMap<&str, &BackendConfig> =
            self.backends.iter().map(|b| (b.name.as_str(), b)).collect();
        let new_by_name: HashMap<&str, &BackendConfig> =
            new.backends.iter().map(|b| (b.name.as_str(), b)).collect();

        let mut added = Vec::new();
        let mut changed = Vec::new();
        for backend in &new.backends {
            match old_by_name.get(backend.name.as_str()) {
                None => added.push(backend.clone()),
                Some(old) if *old != backend => changed.push(backend.clone()),
                _ => {}
            }
        }

        let removed = self
            .backends
            .iter()
            .filter(|b| !new_by_name.contains_key(b.name.as_str()))
            .map(|b| b.name.clone())
            .collect();

        ConfigDiff {
            added,
            removed,
            changed,
        }
    }
}

/// `watch_config` — section 6 "hot-reload". Runs until `shutdown` fires.
/// Grounded on the teacher's `watch_config`: a `notify` watcher feeding a
/// bounded mpsc channel, drained with a 500ms debounce so a burst of writes
/// (e.g. an editor's save-as-temp-then-rename) collapses into one reload.
pub async fn watch_config(
    config_path: PathBuf,
    current_config: Arc<arc_swap::ArcSwap<Config>>,
    reconcile: impl Fn(ConfigDiff) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        error!(path = %config_path.display(), error = %e, "failed to watch config file");
        return;
    }

    info!(path = %config_path.display(), "config file watcher started");
    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("config file changed, reloading");
                let new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse new config, keeping current");
                        continue;
                    }
                };

                let old_config = current_config.load();
                let diff = old_config.diff_backends(&new_config);
                let has_changes = !diff.added.is_empty() || !diff.removed.is_empty() || !diff.changed.is_empty();

                current_config.store(Arc::new(new_config));

                if has_changes {
                    reconcile(diff).await;
                } else {
                    info!("config reloaded, no backend changes detected");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }
}
