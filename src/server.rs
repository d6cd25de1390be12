use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::proxy::{self, StreamReply};
use crate::translate::streaming::RelayBody;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match chat_completions(&state, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Request failed");
            state.logger.error("server", e.to_string());
            e.into_response()
        }
    }
}

async fn chat_completions(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response> {
    // No upstream call without a credential.
    let credential = headers
        .get(AUTHORIZATION)
        .filter(|value| !value.is_empty())
        .ok_or(ProxyError::MissingCredential)?;

    let request: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::invalid_request(format!("Invalid request body: {}", e)))?;

    let is_streaming = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    state.logger.info(
        "server",
        format!(
            "Request: model={} streaming={}",
            request.get("model").and_then(Value::as_str).unwrap_or("-"),
            is_streaming
        ),
    );

    if is_streaming {
        if !state.config.stream.enabled {
            return Err(ProxyError::StreamingDisabled);
        }
        handle_streaming(state, &request, credential).await
    } else {
        handle_non_streaming(state, &request, credential).await
    }
}

async fn handle_non_streaming(
    state: &AppState,
    request: &Value,
    credential: &HeaderValue,
) -> Result<Response> {
    let (status, payload) =
        proxy::proxy_non_streaming(request, credential, &state.config, &state.client, &state.logger)
            .await?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(payload)).into_response())
}

async fn handle_streaming(
    state: &AppState,
    request: &Value,
    credential: &HeaderValue,
) -> Result<Response> {
    let reply =
        proxy::proxy_streaming(request, credential, &state.config, &state.client, &state.logger)
            .await?;

    match reply {
        StreamReply::Events(body) => Ok(event_stream_response(body)),
        StreamReply::Rejected(status, payload) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            Ok((status, Json(payload)).into_response())
        }
    }
}

fn event_stream_response(body: RelayBody) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_root() -> &'static str {
    "Reasoning proxy is running!"
}

async fn handle_health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
