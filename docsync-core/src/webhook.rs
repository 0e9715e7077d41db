use crate::config::Config;
use crate::state::StateStore;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Shared state handed to every webhook route, per §4.5.
#[derive(Clone)]
pub struct WebhookState {
    pub store: StateStore,
    pub config: Arc<Config>,
}

/// Builds the intake router: two signed webhook endpoints plus the
/// unauthenticated `/health` and `/status` probes named in §4.5/§6. Every
/// request is traced (method, path, status, latency) via `tower-http`.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/cloud", post(intake_cloud))
        .route("/webhook/local", post(intake_local))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    queued: bool,
    id: i64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn intake_cloud(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    intake(&state, "cloud", &headers, &body).await
}

async fn intake_local(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    intake(&state, "local", &headers, &body).await
}

/// Verifies the signature (when a secret is configured), extracts
/// `doctype`/`docname` from the payload, and enqueues the notification
/// without performing any sync work inline - §4.5's accept-and-defer
/// contract, so a slow or failing sync never holds the webhook connection
/// open.
async fn intake(
    state: &WebhookState,
    source: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> axum::response::Response {
    if !state.config.webhook_secret.is_empty() {
        match verify_signature(&state.config, headers, body) {
            Ok(()) => {}
            Err(reason) => {
                tracing::warn!(source, reason, "rejected webhook: bad signature");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse { error: reason }),
                )
                    .into_response();
            }
        }
    }

    let payload = match parse_payload(headers, body) {
        Ok(p) => p,
        Err(reason) => {
            tracing::warn!(source, reason, "rejected webhook: unparseable body");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse { error: reason }),
            )
                .into_response();
        }
    };

    let (doctype, docname, action) = match extract_identity(&payload) {
        Some(triple) => triple,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "payload missing doctype/docname".to_string(),
                }),
            )
                .into_response();
        }
    };

    let raw = serde_json::to_string(&payload).ok();
    match state
        .store
        .enqueue_webhook(source, &doctype, &docname, &action, raw.as_deref())
        .await
    {
        Ok(id) => {
            tracing::info!(source, doctype, docname, action, id, "webhook queued");
            (StatusCode::ACCEPTED, Json(QueuedResponse { queued: true, id })).into_response()
        }
        Err(e) => {
            tracing::error!(source, doctype, docname, error = %e, "failed to enqueue webhook");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to queue notification".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Constant-time HMAC-SHA256 verification over the raw request body,
/// reading the signature from the configured header in hex. A missing or
/// malformed header is treated the same as a mismatched signature.
fn verify_signature(config: &Config, headers: &HeaderMap, body: &[u8]) -> Result<(), String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let header_value = headers
        .get(&config.webhook_signature_header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing signature header".to_string())?;

    let expected =
        crate::hash::hex_decode(header_value).ok_or_else(|| "signature is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(config.webhook_secret.as_bytes())
        .map_err(|_| "invalid webhook secret".to_string())?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| "signature does not match".to_string())
}

/// Accepts either `application/json` or `application/x-www-form-urlencoded`
/// bodies (Frappe webhooks commonly post form-encoded with a `data` field
/// carrying the JSON document), per §4.5.
fn parse_payload(headers: &HeaderMap, body: &[u8]) -> Result<Value, String> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let form: Vec<(String, String)> =
            serde_urlencoded::from_bytes(body).map_err(|e| format!("invalid form body: {e}"))?;
        let data_field = form
            .into_iter()
            .find(|(k, _)| k == "data")
            .map(|(_, v)| v)
            .ok_or_else(|| "form body missing 'data' field".to_string())?;
        serde_json::from_str(&data_field).map_err(|e| format!("invalid JSON in 'data' field: {e}"))
    } else {
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))
    }
}

/// Recognized actions; anything else (including a missing `action` field)
/// defaults to `update` per §4.5.
const KNOWN_ACTIONS: &[&str] = &["create", "update", "delete"];

/// Reads `doctype`/`docname`/`action` from the top level of the payload,
/// falling back to a nested `doc` object - Frappe's `doc_event` webhooks
/// wrap the full document under a `doc` key alongside the event name. The
/// `action` is read from the top level regardless of where the identity
/// fields were found, since emitters that nest `doc` still carry the event
/// name (e.g. `event`/`action`) one level up.
fn extract_identity(payload: &Value) -> Option<(String, String, String)> {
    let (doctype, docname) = read_identity(payload).or_else(|| payload.get("doc").and_then(read_identity))?;
    let action = top_level_action(payload);
    Some((doctype, docname, action))
}

fn read_identity(value: &Value) -> Option<(String, String)> {
    let doctype = value.get("doctype").and_then(Value::as_str)?;
    let docname = value
        .get("name")
        .or_else(|| value.get("docname"))
        .and_then(Value::as_str)?;
    Some((doctype.to_string(), docname.to_string()))
}

fn top_level_action(payload: &Value) -> String {
    let raw = payload
        .get("action")
        .or_else(|| payload.get("event"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);

    match raw {
        Some(a) if KNOWN_ACTIONS.contains(&a.as_str()) => a,
        _ => "update".to_string(),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn health(State(state): State<WebhookState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                timestamp: Utc::now(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check: storage unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    timestamp: Utc::now(),
                }),
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    pending: i64,
    processing: i64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn status(State(state): State<WebhookState>) -> impl IntoResponse {
    let (pending, processing) = state.store.queue_status_counts().await.unwrap_or((0, 0));
    Json(StatusResponse {
        pending,
        processing,
        timestamp: Utc::now(),
    })
}
