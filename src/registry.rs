//! `BackendRegistry` — section 4.A. The single shared, concurrent map of live
//! backends. No cross-backend lock is ever held across an await point or an
//! I/O call; every read returns a cheap `Arc<Backend>` clone the caller can
//! use independently.
//!
//! Grounded on the teacher's `BackendManager` (`backend/mod.rs`): a
//! `DashMap<String, Arc<Backend>>` behind a thin API, minus the daemon/session
//! bookkeeping that manager also carried.

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::Backend;
use crate::error::{GatewayError, Result};

#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// `add` — section 4.A. Rejects a duplicate name rather than silently
    /// replacing it; callers that want replace-semantics go through the
    /// reconciler's remove-then-add path instead (section 4.K).
    pub fn add(&self, backend: Arc<Backend>) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(GatewayError::BackendAlreadyExists(name));
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Arc<Backend>> {
        self.backends
            .remove(name)
            .map(|(_, backend)| backend)
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Arc<Backend>> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.backends.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|entry| entry.value().is_healthy())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn with_tool(&self, tool_name: &str) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|entry| entry.value().has_tool(tool_name))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
