// Thin HTTP framing: routing table, JSON parsing, pool introspection. All
// request semantics live in the dispatch layer.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use serde_json::{json, Value};
use tracing::info;

use crate::canonical::MessagesRequest;
use crate::dispatch::{dispatch, DispatchOutcome, Pools};
use crate::error::ProxyError;
use crate::models::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub pools: Arc<Pools>,
    pub config: Arc<AppConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(post_messages))
        .route("/v1/messages/count_tokens", post(post_count_tokens))
        .route("/v1/models", get(get_models))
        .route("/health", get(get_health))
        .route("/account-limits", get(get_account_limits))
        .route("/refresh-token", post(post_refresh_token))
        .route("/clear-cache", post(post_clear_cache))
        .with_state(state)
}

fn error_response(error: &ProxyError) -> Response {
    let body = json!({
        "type": "error",
        "error": { "type": error.error_type(), "message": error.to_string() }
    });
    Response::builder()
        .status(StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

fn client_authorized(config: &AppConfig, headers: &HeaderMap) -> bool {
    let Some(expected) = config.api_key.as_deref() else {
        return true;
    };
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if key == expected {
            return true;
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if auth.strip_prefix("Bearer ") == Some(expected) {
            return true;
        }
    }
    false
}

async fn post_messages(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !client_authorized(&state.config, &headers) {
        return error_response(&ProxyError::Unauthorized("invalid api key".to_string()));
    }

    let mut request: MessagesRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&ProxyError::ContractViolation(format!(
                "malformed messages request: {}",
                e
            )))
        }
    };
    if query.get("stream").map(|v| v == "true").unwrap_or(false) {
        request.stream = true;
    }

    match dispatch(request, &state.pools, &state.config).await {
        Ok(DispatchOutcome::Stream(stream)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(stream))
            .unwrap_or_default(),
        Ok(DispatchOutcome::Json(value)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap_or_default(),
        Err(error) => error_response(&error),
    }
}

async fn post_count_tokens() -> Response {
    let body = json!({
        "type": "error",
        "error": {
            "type": "not_implemented_error",
            "message": "token counting is not implemented by this proxy"
        }
    });
    Response::builder()
        .status(StatusCode::NOT_IMPLEMENTED)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

async fn get_models(State(state): State<AppState>) -> Json<Value> {
    let backends = &state.config.backends;
    let mut data: Vec<Value> = Vec::new();
    for models in [
        &backends.cloudcode.models,
        &backends.codex.models,
        &backends.copilot.models,
        &backends.cursor.models,
    ] {
        for model in models.iter() {
            data.push(json!({ "id": model, "type": "model" }));
        }
    }
    Json(json!({ "data": data }))
}

async fn get_health(State(state): State<AppState>) -> Json<Value> {
    let mut pools = serde_json::Map::new();
    for pool in state.pools.all() {
        let snapshot = pool.snapshot().await;
        let available = snapshot.iter().filter(|s| s.state == "available").count();
        pools.insert(
            pool.backend_name().to_string(),
            json!({ "accounts": snapshot.len(), "available": available }),
        );
    }
    Json(json!({ "status": "ok", "pools": pools }))
}

async fn get_account_limits(State(state): State<AppState>) -> Json<Value> {
    let mut out = serde_json::Map::new();
    for pool in state.pools.all() {
        let snapshot = pool.snapshot().await;
        out.insert(
            pool.backend_name().to_string(),
            serde_json::to_value(snapshot).unwrap_or(Value::Null),
        );
    }
    Json(Value::Object(out))
}

async fn post_refresh_token(State(state): State<AppState>) -> Json<Value> {
    let mut refreshed = serde_json::Map::new();
    for pool in state.pools.all() {
        let count = pool.force_refresh_all().await;
        refreshed.insert(pool.backend_name().to_string(), json!(count));
    }
    Json(json!({ "refreshed": refreshed }))
}

async fn post_clear_cache(State(state): State<AppState>) -> Json<Value> {
    for pool in state.pools.all() {
        pool.clear_cooldowns().await;
    }
    Json(json!({ "status": "cleared" }))
}

pub async fn serve(config: AppConfig, pools: Pools) -> Result<(), String> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState {
        pools: Arc::new(pools),
        config: Arc::new(config),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed_to_bind {}: {}", addr, e))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| format!("server_error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_check_accepts_either_header() {
        let mut config = AppConfig::default();
        config.api_key = Some("secret".to_string());

        let mut headers = HeaderMap::new();
        assert!(!client_authorized(&config, &headers));

        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(client_authorized(&config, &headers));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(client_authorized(&config, &headers));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(!client_authorized(&config, &headers));
    }

    #[test]
    fn open_proxy_without_configured_key() {
        let config = AppConfig::default();
        assert!(client_authorized(&config, &HeaderMap::new()));
    }

    #[test]
    fn error_bodies_are_anthropic_shaped() {
        let response = error_response(&ProxyError::ContractViolation("bad".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
