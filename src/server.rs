//! ==============================================================================
//! server.rs - http api and live feed
//! ==============================================================================
//!
//! routes:
//!
//! ```text
//!     GET  /update     push via query string (t, h, ts, source)
//!     POST /update     push via json or form body (same keys)
//!     GET  /current    arbitrated current reading
//!     GET  /latest     newest stored row
//!     GET  /history    newest-first rows, ?limit=N (default 100)
//!     GET  /stream     server-sent events, one json event per message
//!     GET  /health     liveness + device reader state
//!     *                static frontend files
//! ```
//!
//! relationships:
//!     - uses: gateway.rs for every operation
//!     - reads: device.rs reader state through a watch channel
//!
//! ==============================================================================

use axum::{
    body::{self, Body},
    extract::{FromRequest, Query, RawQuery, Request, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Form, Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::device::ReaderState;
use crate::domain::{Current, StoredRow};
use crate::error::ApiError;
use crate::gateway::{Gateway, PushRequest};

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
const MAX_PUSH_BODY: usize = 64 * 1024;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// `None` when the serial reader is disabled
    pub device: Option<watch::Receiver<ReaderState>>,
}

pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/update", get(push_query_handler).post(push_body_handler))
        .route("/current", get(current_handler))
        .route("/latest", get(latest_handler))
        .route("/history", get(history_handler))
        .route("/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

// ==============================================================================
// push
// ==============================================================================

/// GET /update?t=22.5&h=45
async fn push_query_handler(
    State(state): State<AppState>,
    Query(mut request): Query<PushRequest>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>, ApiError> {
    request.raw = raw;
    push(&state.gateway, request).await
}

/// POST /update with a form body or a json object; anything else counts as empty
async fn push_body_handler(State(state): State<AppState>, request: Request) -> Result<Json<Value>, ApiError> {
    let (parts, raw_body) = request.into_parts();
    let bytes = match body::to_bytes(raw_body, MAX_PUSH_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable push body");
            Default::default()
        }
    };

    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let request = if is_form {
        let raw = String::from_utf8_lossy(&bytes).into_owned();
        let form = Form::<PushRequest>::from_request(Request::from_parts(parts, Body::from(bytes)), &state).await;
        match form {
            Ok(Form(mut request)) => {
                request.raw = Some(raw);
                request
            }
            Err(e) => {
                tracing::debug!(error = %e, "undecodable form push");
                PushRequest::default()
            }
        }
    } else {
        let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        PushRequest::from_json(&value)
    };

    push(&state.gateway, request).await
}

async fn push(gateway: &Gateway, request: PushRequest) -> Result<Json<Value>, ApiError> {
    let row = gateway.push(request).await?;
    Ok(Json(json!({ "status": "ok", "reading": row })))
}

// ==============================================================================
// queries
// ==============================================================================

async fn current_handler(State(state): State<AppState>) -> Result<Json<Current>, ApiError> {
    let current = state.gateway.current().await?.ok_or(ApiError::NoData)?;
    Ok(Json(current))
}

async fn latest_handler(State(state): State<AppState>) -> Result<Json<StoredRow>, ApiError> {
    let row = state.gateway.latest().await?.ok_or(ApiError::NoData)?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<String>,
}

/// unparsable or negative limits fall back to the default
fn history_limit(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(DEFAULT_HISTORY_LIMIT)
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.gateway.recent(history_limit(params.limit.as_deref())).await?;
    Ok(Json(json!({ "count": rows.len(), "readings": rows })))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let device = match &state.device {
        Some(rx) => json!(*rx.borrow()),
        None => json!("disabled"),
    };
    Json(json!({ "status": "ok", "device": device }))
}

// ==============================================================================
// live feed
// ==============================================================================

/// one subscriber per connection; the subscription leaves the hub when the
/// client goes away and axum drops the stream
async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.gateway.subscribe().await;

    let events = stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        Some((Event::default().json_data(&event), sub))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
