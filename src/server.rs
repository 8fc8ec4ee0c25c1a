//! HTTP surface: the Anthropic-compatible API plus health and model listing.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::logging::SharedLogger;
use crate::proxy::{self, UnaryOutcome};
use crate::route::{resolve_credential, resolve_route};
use crate::translate::anthropic::{ErrorResponse, MessagesRequest};

use axum::body::Body;
use axum::extract::State;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::{ResponseBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Client-facing bounds: a stalled client must not hold a request open
    // forever. read_timeout covers receiving the request and producing the
    // response head (408 on expiry); write_timeout bounds each response body
    // frame, so an active SSE stream (kept alive by periodic comments) is
    // not cut off mid-flight.
    let read_timeout = Duration::from_secs(state.config.server.read_timeout);
    let write_timeout = Duration::from_secs(state.config.server.write_timeout);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/health/ready", get(handle_ready))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(read_timeout))
        .layer(ResponseBodyTimeoutLayer::new(write_timeout))
        .with_state(state)
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("failed to parse request: {e}"));
            let err = ErrorResponse::invalid_request(format!("Invalid JSON: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    if let Err(e) = proxy::validate_request(&req) {
        return error_response(&e);
    }

    let route = match resolve_route(&state.config, &req.model) {
        Ok(r) => r,
        Err(e) => {
            state.logger.warn("server", format!("routing failed: {e}"));
            return error_response(&e);
        }
    };

    let secret = match resolve_credential(&route, &headers) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    let is_streaming = req.stream.unwrap_or(false);
    state.logger.info_with_context(
        "server",
        format!(
            "request: model={} provider={} streaming={}",
            req.model, route.provider.name, is_streaming
        ),
        serde_json::json!({ "has_api_key": headers.contains_key("x-api-key") }),
    );

    if is_streaming {
        match proxy::relay_stream(&req, &route, &secret, &state.client, &state.logger).await {
            Ok(frames) => sse_response(frames),
            Err(e) => {
                state.logger.error("server", format!("stream setup failed: {e}"));
                error_response(&e)
            }
        }
    } else {
        match proxy::relay_unary(&req, &route, &secret, &state.client, &state.logger).await {
            Ok(UnaryOutcome::Translated(resp)) => Json(resp).into_response(),
            Ok(UnaryOutcome::Raw { status, body }) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(e) => {
                state.logger.error("server", format!("relay failed: {e}"));
                error_response(&e)
            }
        }
    }
}

fn sse_response(frames: crate::stream::SseStream) -> Response {
    let event_stream = frames.map(|frame| -> std::result::Result<Event, Infallible> {
        let mut event = Event::default().data(frame.data);
        if let Some(name) = frame.event {
            event = event.event(name);
        }
        Ok(event)
    });

    let mut response = Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn error_response(err: &RelayError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = ErrorResponse::new(err.error_type(), err.to_string());
    (status, Json(envelope)).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut providers = serde_json::Map::new();
    for provider in &state.config.providers {
        let status = if provider.is_configured() {
            "configured"
        } else {
            "not_configured"
        };
        providers.insert(provider.name.clone(), status.into());
    }

    Json(serde_json::json!({
        "status": "ready",
        "providers": providers,
        "total_providers": state.config.providers.len(),
        "total_mappings": state.config.mappings.len(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let created = chrono::Utc::now().timestamp();
    let models: Vec<serde_json::Value> = state
        .config
        .providers
        .iter()
        .flat_map(|provider| {
            provider.models.iter().map(move |model| {
                serde_json::json!({
                    "id": format!("{}/{}", provider.name, model),
                    "object": "model",
                    "created": created,
                    "owned_by": provider.name,
                })
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": models }))
}
