//! Backend identity, configuration, and source grammar — section 3 & section 6.
//!
//! Grounded on the reference implementation's `domain/entities/backend.py`,
//! `domain/value_objects/backend_source.py`, `github_spec.py`, and
//! `process_config.py`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::domain::health::{CircuitBreakerSettings, HealthCheckSettings, HealthState};
use crate::error::{GatewayError, Result};

/// `owner/repo[/subpath]`, parsed out of a `github:` source string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubSpec {
    pub owner: String,
    pub repo: String,
    pub subpath: Option<String>,
}

impl GithubSpec {
    /// Parses `github:<owner>/<repo>[/<subpath>]`. Grounded on
    /// `GitHubSpec.from_url`.
    pub fn parse(spec: &str) -> Result<Self> {
        let path = spec.strip_prefix("github:").ok_or_else(|| {
            GatewayError::InvalidConfiguration(format!("invalid github spec: {spec}"))
        })?;

        let mut parts = path.splitn(3, '/');
        let owner = parts.next().filter(|s| !s.is_empty());
        let repo = parts.next().filter(|s| !s.is_empty());
        let (owner, repo) = match (owner, repo) {
            (Some(o), Some(r)) => (o.to_string(), r.to_string()),
            _ => {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "github spec must be owner/repo: {spec}"
                )));
            }
        };
        let subpath = parts.next().map(str::to_string);

        Ok(Self {
            owner,
            repo,
            subpath,
        })
    }

    pub fn to_package_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Lowercased repo name with a leading `mcp-server-`, `server-`, or `mcp-`
    /// prefix stripped.
    pub fn infer_namespace(&self) -> String {
        strip_known_prefix(&self.repo.to_lowercase())
    }
}

/// Strips the longest matching namespace prefix, per section 6's "Namespace
/// derivation": `mcp-server-`, `server-`, `mcp-` (checked in that order so the
/// longer compound prefix wins over the shorter one it contains).
pub fn strip_known_prefix(name: &str) -> String {
    for prefix in ["mcp-server-", "server-", "mcp-"] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

/// Merged env + immutable argument list for a locally-spawned backend process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let command = command.into();
        if command.is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "process command cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            args,
            port: None,
            env: HashMap::new(),
        })
    }
}

/// `BackendSource` — section 3. The discriminant and its payload are kept in
/// lock-step by construction (no bare enum-with-optional-fields), so an
/// invalid combination (e.g. `Http` carrying a `ProcessConfig`) is
/// unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSource {
    Http { url: String },
    Github { spec: GithubSpec, process: ProcessConfig },
    Package { name: String, process: ProcessConfig },
}

impl BackendSource {
    /// Parses the `register_backend.source` grammar of section 6:
    /// `http(s)://…` → Http, `github:owner/repo[/subpath]` → Github, else →
    /// Package. The `process` command defaults to `npx` with the package
    /// name as argument for the non-HTTP variants — callers that need a
    /// different launcher should set `process_config` explicitly afterward.
    pub fn parse(source: &str) -> Result<Self> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(BackendSource::Http {
                url: source.to_string(),
            });
        }
        if source.starts_with("github:") {
            let spec = GithubSpec::parse(source)?;
            let process = ProcessConfig::new("npx", vec!["-y".to_string(), spec.to_package_name()])?;
            return Ok(BackendSource::Github { spec, process });
        }
        let process = ProcessConfig::new("npx", vec!["-y".to_string(), source.to_string()])?;
        Ok(BackendSource::Package {
            name: source.to_string(),
            process,
        })
    }

    /// The section-6 string grammar, inverse of `parse`: `http(s)://…` as-is,
    /// `github:owner/repo[/subpath]`, or the bare package name. A backend
    /// built directly with a `ProcessConfig` the caller customized beyond
    /// `parse`'s `npx -y <pkg>` default loses that customization on
    /// round-trip through this string — the desired-state file format
    /// (section 6) has no field for an arbitrary launcher command, only
    /// `source` and `port`.
    pub fn to_source_string(&self) -> String {
        match self {
            BackendSource::Http { url } => url.clone(),
            BackendSource::Github { spec, .. } => {
                let mut s = format!("github:{}/{}", spec.owner, spec.repo);
                if let Some(subpath) = &spec.subpath {
                    s.push('/');
                    s.push_str(subpath);
                }
                s
            }
            BackendSource::Package { name, .. } => name.clone(),
        }
    }

    pub fn process_config(&self) -> Option<&ProcessConfig> {
        match self {
            BackendSource::Http { .. } => None,
            BackendSource::Github { process, .. } => Some(process),
            BackendSource::Package { process, .. } => Some(process),
        }
    }

    pub fn process_config_mut(&mut self) -> Option<&mut ProcessConfig> {
        match self {
            BackendSource::Http { .. } => None,
            BackendSource::Github { process, .. } => Some(process),
            BackendSource::Package { process, .. } => Some(process),
        }
    }

    /// Derives a namespace when the caller didn't supply one explicitly.
    /// Grounded on `NamespaceGenerator.generate`.
    pub fn derive_namespace(&self) -> Result<String> {
        match self {
            BackendSource::Http { .. } => Err(GatewayError::InvalidConfiguration(
                "an explicit namespace is required for http-only backends".to_string(),
            )),
            BackendSource::Github { spec, .. } => Ok(spec.infer_namespace()),
            BackendSource::Package { name, .. } => {
                let last_segment = name.rsplit('/').next().unwrap_or(name);
                Ok(strip_known_prefix(&last_segment.to_lowercase()))
            }
        }
    }

    /// Derives a backend name when the caller didn't supply one: the github
    /// repo name, the package name, or (for http) an error (names must be
    /// explicit for http-only backends, same rationale as namespaces).
    pub fn derive_name(&self) -> Result<String> {
        match self {
            BackendSource::Http { .. } => Err(GatewayError::InvalidConfiguration(
                "an explicit name is required for http-only backends".to_string(),
            )),
            BackendSource::Github { spec, .. } => Ok(spec.repo.clone()),
            BackendSource::Package { name, .. } => {
                Ok(name.rsplit('/').next().unwrap_or(name).to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Path,
    Capability,
    Fallback,
}

/// `Route` — section 3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub pattern: String,
    pub strategy: RouteStrategy,
    #[serde(default)]
    pub fallback_to: Option<String>,
}

/// Static configuration of a backend, as held by the registry and compared
/// for equality by the reconciler (section 4.K: "deep equality").
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub source: BackendSource,
    pub namespace: String,
    pub priority: u32,
    pub routes: Vec<Route>,
    pub health_check: HealthCheckSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub auto_start: bool,
}

fn default_priority() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

/// On-disk shape of a backend entry (section 6): `source` is the string
/// grammar (or a bare `url` key as sugar for an `Http` source) plus an
/// optional top-level `port` applied to the process config of github/package
/// sources. This is deliberately not `BackendConfig` itself — the in-memory
/// type also needs to be buildable directly (by `register_backend`, by
/// tests) from an already-parsed `BackendSource`, which has no string form
/// to round-trip through.
#[derive(Debug, Deserialize)]
struct RawBackendConfig {
    name: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_true")]
    auto_start: bool,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    health_check: HealthCheckSettings,
    #[serde(default)]
    circuit_breaker: CircuitBreakerSettings,
}

impl<'de> Deserialize<'de> for BackendConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawBackendConfig::deserialize(deserializer)?;

        let mut source = match (raw.url, raw.source) {
            (Some(url), None) => BackendSource::Http { url },
            (None, Some(source)) => BackendSource::parse(&source).map_err(serde::de::Error::custom)?,
            (Some(_), Some(_)) => {
                return Err(serde::de::Error::custom(format!(
                    "backend '{}': specify either 'source' or 'url', not both",
                    raw.name
                )));
            }
            (None, None) => {
                return Err(serde::de::Error::custom(format!(
                    "backend '{}': requires a 'source' (or 'url') field",
                    raw.name
                )));
            }
        };

        if let Some(port) = raw.port
            && let Some(process) = source.process_config_mut()
        {
            process.port = Some(port);
        }

        let namespace = match raw.namespace {
            Some(namespace) => namespace,
            None => source.derive_namespace().map_err(serde::de::Error::custom)?,
        };

        Ok(BackendConfig {
            name: raw.name,
            source,
            namespace,
            priority: raw.priority,
            routes: raw.routes,
            health_check: raw.health_check,
            circuit_breaker: raw.circuit_breaker,
            auto_start: raw.auto_start,
        })
    }
}

impl Serialize for BackendConfig {
    /// Writes keys in section 6's documented order: `name, source, namespace,
    /// priority, auto_start, port, routes, health_check, circuit_breaker`.
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let port = self.source.process_config().and_then(|p| p.port);
        let mut state = serializer.serialize_struct("BackendConfig", 9)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("source", &self.source.to_source_string())?;
        state.serialize_field("namespace", &self.namespace)?;
        state.serialize_field("priority", &self.priority)?;
        state.serialize_field("auto_start", &self.auto_start)?;
        state.serialize_field("port", &port)?;
        state.serialize_field("routes", &self.routes)?;
        state.serialize_field("health_check", &self.health_check)?;
        state.serialize_field("circuit_breaker", &self.circuit_breaker)?;
        state.end()
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "backend name cannot be empty".to_string(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(GatewayError::InvalidConfiguration(format!(
                "backend '{}': namespace cannot be empty",
                self.name
            )));
        }
        for route in &self.routes {
            if route.pattern.is_empty() {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "backend '{}': route pattern cannot be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A descriptor for a discovered tool, resource, or prompt (section 4.E).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: Option<String>,
}

/// A discovered resource, keyed by URI rather than name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub description: Option<String>,
}

/// Runtime capability snapshot of a backend (section 3 "Runtime" fields).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: Vec<CapabilityDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<CapabilityDescriptor>,
}

impl Capabilities {
    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool_name)
    }
}

/// Runtime process bookkeeping (section 3: "optional `process-id` when
/// locally supervised").
#[derive(Debug, Clone, Default)]
pub struct ProcessState {
    pub process_id: Option<u32>,
    pub allocated_port: Option<u16>,
}

/// The `Backend` entity (section 3). Owned exclusively by the registry;
/// every other component holds a non-owning `Arc<Backend>` keyed by name
/// (section 3 "Lifecycle", section 9 "Client map").
///
/// Health state and capabilities are independently interior-mutable so that
/// F (discovery) and G/H (health) never contend with each other's locks —
/// matching the "no cross-backend locks held during I/O" rule in section 5,
/// generalized here to "no cross-concern locks" within one backend.
pub struct Backend {
    pub config: BackendConfig,
    health: Mutex<HealthState>,
    capabilities: RwLock<Capabilities>,
    process: Mutex<ProcessState>,
    last_capability_refresh: Mutex<Option<std::time::Instant>>,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            health: Mutex::new(HealthState::new()),
            capabilities: RwLock::new(Capabilities::default()),
            process: Mutex::new(ProcessState::default()),
            last_capability_refresh: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// `is_healthy AND circuit != OPEN` (section 3 "Lifecycle", section 4.A `healthy()`).
    pub fn is_healthy(&self) -> bool {
        let health = self.health.lock().expect("health mutex poisoned");
        health.is_healthy && !health.is_circuit_open()
    }

    pub fn circuit_state(&self) -> crate::domain::health::CircuitState {
        self.health.lock().expect("health mutex poisoned").circuit_state
    }

    pub fn with_health<R>(&self, f: impl FnOnce(&HealthState) -> R) -> R {
        f(&self.health.lock().expect("health mutex poisoned"))
    }

    pub fn record_success(&self) {
        self.health.lock().expect("health mutex poisoned").record_success();
    }

    pub fn record_failure(&self, msg: impl Into<String>) {
        let mut health = self.health.lock().expect("health mutex poisoned");
        health.record_failure(msg, &self.config.circuit_breaker);
    }

    pub fn record_half_open_success(&self) {
        let mut health = self.health.lock().expect("health mutex poisoned");
        health.record_half_open_success(&self.config.circuit_breaker);
    }

    pub fn enter_half_open(&self) {
        self.health.lock().expect("health mutex poisoned").enter_half_open();
    }

    pub fn should_attempt_half_open(&self) -> bool {
        let health = self.health.lock().expect("health mutex poisoned");
        crate::domain::health::should_attempt_half_open(&health, &self.config.circuit_breaker)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().expect("capabilities rwlock poisoned").clone()
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.capabilities
            .read()
            .expect("capabilities rwlock poisoned")
            .has_tool(tool_name)
    }

    /// `update_capabilities` — section 4.F: replaces the capability fields
    /// atomically and advances the refresh timestamp.
    pub fn update_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.write().expect("capabilities rwlock poisoned") = capabilities;
        *self
            .last_capability_refresh
            .lock()
            .expect("refresh mutex poisoned") = Some(std::time::Instant::now());
    }

    pub fn capabilities_stale(&self, ttl: std::time::Duration) -> bool {
        match *self.last_capability_refresh.lock().expect("refresh mutex poisoned") {
            Some(last) => last.elapsed() > ttl,
            None => true,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.lock().expect("process mutex poisoned").process_id
    }

    pub fn set_process(&self, process_id: Option<u32>, allocated_port: Option<u16>) {
        let mut process = self.process.lock().expect("process mutex poisoned");
        process.process_id = process_id;
        process.allocated_port = allocated_port;
    }

    pub fn allocated_port(&self) -> Option<u16> {
        self.process.lock().expect("process mutex poisoned").allocated_port
    }

    /// The base URL this backend is reachable at (section 6 `list_backends`/
    /// `register_backend` response shape). `Http` sources carry their own
    /// url verbatim; process-backed sources are reachable at the loopback
    /// port the supervisor allocated, once the process has started.
    pub fn base_url(&self) -> String {
        match &self.config.source {
            BackendSource::Http { url } => url.clone(),
            BackendSource::Github { .. } | BackendSource::Package { .. } => self
                .allocated_port()
                .map(|port| format!("http://127.0.0.1:{port}"))
                .unwrap_or_default(),
        }
    }
}
