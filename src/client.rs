//! Backend Client Port — section 4.E. One abstract contract used identically
//! for HTTP backends and for locally-supervised child processes addressed at
//! `127.0.0.1:port` (both speak plain JSON over HTTP; the concrete tool-RPC
//! wire format is out of scope per section 1, so this talks a minimal
//! JSON-RPC-shaped envelope rather than any particular MCP transport).
//!
//! Grounded on the teacher's `backend::Backend` trait (`backend/mod.rs`) for
//! the method surface, and on `backend/http.rs` for the reqwest client
//! construction pattern — simplified since this port doesn't need the
//! teacher's rmcp handshake or header-forwarding machinery.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::domain::backend::{CapabilityDescriptor, ResourceDescriptor};
use crate::error::{GatewayError, Result};

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>>;
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;
    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>>;
    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value>;
    async fn get_resource(&self, uri: &str) -> Result<String>;

    /// Never raises — failures collapse to `false` (section 4.E).
    async fn ping(&self) -> bool;
}

/// An HTTP-addressed backend, whether a remote service or a child process
/// bound to `127.0.0.1:<port>`.
pub struct HttpBackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport {
                backend_name: String::new(),
                source: anyhow::Error::new(e),
            })?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                backend_name: self.base_url.clone(),
                source: anyhow::Error::new(e),
            })?
            .error_for_status()
            .map_err(|e| GatewayError::Transport {
                backend_name: self.base_url.clone(),
                source: anyhow::Error::new(e),
            })?;
        response.json::<T>().await.map_err(|e| GatewayError::Transport {
            backend_name: self.base_url.clone(),
            source: anyhow::Error::new(e),
        })
    }
}

#[derive(Deserialize)]
struct ResourceBody {
    text: String,
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>> {
        self.get_json("/tools").await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.get_json("/resources").await
    }

    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>> {
        self.get_json("/prompts").await
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(&format!("/tools/{tool_name}/call")))
            .json(&arguments)
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                backend_name: self.base_url.clone(),
                source: anyhow::Error::new(e),
            })?
            .error_for_status()
            .map_err(|e| GatewayError::Transport {
                backend_name: self.base_url.clone(),
                source: anyhow::Error::new(e),
            })?;
        response.json::<Value>().await.map_err(|e| GatewayError::Transport {
            backend_name: self.base_url.clone(),
            source: anyhow::Error::new(e),
        })
    }

    async fn get_resource(&self, uri: &str) -> Result<String> {
        let encoded = urlencoding_minimal(uri);
        let body: ResourceBody = self.get_json(&format!("/resources/{encoded}")).await?;
        Ok(body.text)
    }

    async fn ping(&self) -> bool {
        self.http
            .get(self.url("/health"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Percent-encodes only the characters that would otherwise break a path
/// segment; resource URIs are free-form (e.g. `postgres://host/table`) so a
/// full `url`-crate dependency isn't warranted for this single call site.
fn urlencoding_minimal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
