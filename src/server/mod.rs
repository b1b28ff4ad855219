use axum::{
    routing::{get, post},
    Router,
};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{PortdError, PortdResult};
use crate::pipeline::Pipeline;
use crate::registry::{parse_index, Registry};

pub mod error;
pub mod patches;
pub mod ports;
pub mod views;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ports", get(ports::list_ports).post(ports::create_port))
        .route(
            "/api/ports/:id",
            get(ports::get_port)
                .patch(ports::update_port)
                .delete(ports::remove_port),
        )
        .route("/api/patches", get(patches::list_patches))
        .route(
            "/api/patches/:id",
            get(patches::get_patch).patch(patches::update_patch),
        )
        .route("/api/patches/:id/retry", post(patches::retry_patch))
        .route("/api/patches/:id/diff", get(patches::get_diff))
        .route("/api/logs/:log", get(patches::get_log))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn run_http_server(config: AppConfig) -> PortdResult<()> {
    let (queue, jobs) = mpsc::unbounded_channel();
    let registry = Arc::new(Registry::open(&config)?.with_queue(queue));

    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        config.pipeline.targets.clone(),
        config.pipeline.stage_timeout(),
    ));
    pipeline.spawn(jobs);
    registry.resume_pending().await?;

    if let Some(index) = &config.ports.index {
        let text = tokio::fs::read_to_string(index).await?;
        registry.sync_index(&parse_index(&text)?).await?;
    }

    let app = router(AppState { registry });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|err| PortdError::Config(format!("invalid server address: {err}")))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| PortdError::Internal(format!("failed to bind server: {err}")))?;

    info!(%addr, "portd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| PortdError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Reject any field of a write body outside `writable`.
pub(crate) fn check_writable(body: &Map<String, Value>, writable: &[&str]) -> PortdResult<()> {
    match body.keys().find(|key| !writable.contains(&key.as_str())) {
        Some(key) => Err(PortdError::FieldNotWritable(key.clone())),
        None => Ok(()),
    }
}

pub(crate) fn optional_string<'a>(
    body: &'a Map<String, Value>,
    field: &str,
) -> PortdResult<Option<&'a str>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(PortdError::Validation(format!(
            "field '{}' must be a string",
            field
        ))),
    }
}

pub(crate) fn required_string<'a>(body: &'a Map<String, Value>, field: &str) -> PortdResult<&'a str> {
    optional_string(body, field)?
        .ok_or_else(|| PortdError::Validation(format!("field '{}' is required", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_check_writable() {
        let update = body(json!({"log": "x", "origin": "math/R-cran-foo"}));
        assert!(matches!(
            check_writable(&update, &["log", "status"]),
            Err(PortdError::FieldNotWritable(field)) if field == "origin"
        ));
        assert!(check_writable(&body(json!({"log": "x"})), &["log", "status"]).is_ok());
    }

    #[test]
    fn test_string_fields() {
        let create = body(json!({"source": "cran", "name": 5}));
        assert_eq!(required_string(&create, "source").unwrap(), "cran");
        assert!(matches!(
            required_string(&create, "name"),
            Err(PortdError::Validation(_))
        ));
        assert!(optional_string(&create, "maintainer").unwrap().is_none());
    }
}
