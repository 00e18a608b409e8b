//! Admin surface — section 6. A small JSON API exposing the gateway-facing
//! operations, bound to loopback by default. No auth (trusted-network
//! Non-goal). Feature-gated behind `admin`, default-on.
//!
//! Grounded on the teacher's `admin::api` module: same `axum::Router` +
//! `AdminState` + graceful-shutdown-via-notify shape, routes renamed to the
//! operations section 6 actually names.

#[cfg(feature = "admin")]
pub mod api {
    use axum::extract::{Path, State};
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde::Deserialize;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tracing::info;

    use crate::domain::routing::Strategy;
    use crate::error::GatewayError;
    use crate::gateway::{BackendHealth, BackendSummary, Gateway, RegisterBackendResponse};
    use crate::reconciler::ReconcileReport;

    #[derive(Clone)]
    pub struct AdminState {
        pub gateway: Arc<Gateway>,
        pub config_path: PathBuf,
    }

    pub async fn start(state: AdminState, listen: &str, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/api/backends", get(list_backends))
            .route("/api/backends/{name}/health", get(backend_health))
            .route("/api/backends/{name}", delete(unregister_backend))
            .route("/api/backends", post(register_backend))
            .route("/api/call/{tool_name}", post(call_tool))
            .route("/api/reload", post(reload_config))
            .with_state(state);

        let listener = TcpListener::bind(listen).await?;
        info!(listen = %listen, "admin API started");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!("admin API stopped");
        Ok(())
    }

    fn status_for(err: &GatewayError) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match err {
            GatewayError::BackendNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BackendAlreadyExists(_) => StatusCode::CONFLICT,
            GatewayError::NoHealthyBackends { .. } | GatewayError::Routing { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    type JsonResult<T> = Result<Json<T>, (axum::http::StatusCode, Json<serde_json::Value>)>;

    fn to_response<T>(result: crate::error::Result<T>) -> JsonResult<T> {
        result.map(Json).map_err(|e| {
            let status = status_for(&e);
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        })
    }

    async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendSummary>> {
        Json(state.gateway.list_backends())
    }

    async fn backend_health(State(state): State<AdminState>, Path(name): Path<String>) -> JsonResult<BackendHealth> {
        to_response(state.gateway.get_backend_health(&name))
    }

    #[derive(Deserialize)]
    pub struct RegisterRequest {
        pub source: String,
        pub name: Option<String>,
        pub namespace: Option<String>,
        pub priority: Option<u32>,
        pub auto_start: Option<bool>,
        pub health_check_enabled: Option<bool>,
    }

    async fn register_backend(
        State(state): State<AdminState>,
        Json(req): Json<RegisterRequest>,
    ) -> JsonResult<RegisterBackendResponse> {
        to_response(
            state
                .gateway
                .register_backend(
                    &req.source,
                    req.name,
                    req.namespace,
                    req.priority,
                    req.auto_start,
                    req.health_check_enabled,
                )
                .await,
        )
    }

    async fn unregister_backend(
        State(state): State<AdminState>,
        Path(name): Path<String>,
    ) -> JsonResult<()> {
        to_response(state.gateway.unregister_backend(&name).await)
    }

    #[derive(Deserialize)]
    pub struct CallToolRequest {
        #[serde(default)]
        pub arguments: Value,
        pub strategy: Option<Strategy>,
    }

    async fn call_tool(
        State(state): State<AdminState>,
        Path(tool_name): Path<String>,
        Json(req): Json<CallToolRequest>,
    ) -> JsonResult<crate::invocation::InvocationOutcome> {
        to_response(
            state
                .gateway
                .call_tool(&tool_name, req.arguments, req.strategy)
                .await,
        )
    }

    async fn reload_config(State(state): State<AdminState>) -> Json<ReconcileReport> {
        match state.gateway.reload_config(&state.config_path).await {
            Ok(report) => Json(report),
            Err(e) => Json(ReconcileReport {
                errors: vec![e.to_string()],
                ..Default::default()
            }),
        }
    }
}
