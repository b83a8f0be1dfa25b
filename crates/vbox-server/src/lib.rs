pub mod config;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use libvbox::LifecycleCoordinator;
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub struct AppState {
    pub coordinator: LifecycleCoordinator,
    /// Largest text frame accepted from a client.
    pub max_frame_bytes: usize,
}

pub fn app(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let boxes = state.coordinator.active_boxes().await;
    Json(json!({ "status": "ok", "activeBoxes": boxes.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cors_accepts_wildcard() {
        assert!(build_cors(&["*".to_string()]).is_ok());
    }

    #[test]
    fn build_cors_rejects_bad_origin() {
        assert!(build_cors(&["http://bad\norigin".to_string()]).is_err());
    }
}
