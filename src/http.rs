//! External Interface Surface: the OpenAI-compatible HTTP front door plus
//! the admin/unload/events/config endpoints. Generalizes the teacher's
//! admin-only Router+TcpListener wiring into the primary service surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::events::Event as BusEvent;
use crate::events::MetricRecord;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/api/models/unload", post(unload_all))
        .route("/api/models/unload/{model_id}", post(unload_one))
        .route("/upstream/{model_id}/{*rest}", get(upstream_get).post(upstream_post))
        .route("/api/events", get(events_sse))
        .route("/api/config/{*rest}", post(config_forward))
        .with_state(state)
}

/// Binds the listen address up front so a bind failure can be reported to
/// the caller (and mapped to its own process exit code) before any
/// long-running serve future is spawned.
pub async fn bind(listen: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "http surface listening");
    Ok(listener)
}

pub async fn serve(state: AppState, listener: TcpListener, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    info!("http surface stopped");
    Ok(())
}

#[derive(Serialize)]
struct LivenessBody {
    status: &'static str,
    uptime_secs: u64,
}

async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.scheduler.is_draining() { "draining" } else { "ok" };
    Json(LivenessBody { status, uptime_secs: state.started_at.elapsed().as_secs() })
}

#[derive(Serialize)]
struct ModelListItem {
    id: String,
    object: &'static str,
    display_name: String,
    state: Option<&'static str>,
    /// Declarative size hint in bytes, when the loaded config carries one;
    /// `None` when the Config Producer that generated it didn't supply it.
    size_hint_bytes: Option<u64>,
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<ModelListItem> = state
        .scheduler
        .list_models()
        .into_iter()
        .map(|m| ModelListItem {
            id: m.id,
            object: "model",
            display_name: m.display_name,
            state: m.state.map(state_label),
            size_hint_bytes: m.size_hint_bytes,
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": models }))
}

fn state_label(state: crate::process::ProcessState) -> &'static str {
    use crate::process::ProcessState::*;
    match state {
        Stopped => "stopped",
        Starting => "starting",
        Ready => "ready",
        Stopping => "stopping",
        Failed => "failed",
        Shutdown => "shutdown",
    }
}

async fn unload_all(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.unload_all(true).await;
    Json(serde_json::json!({ "unloaded": true }))
}

async fn unload_one(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, SchedulerError> {
    let unloaded = state.scheduler.unload_model(&model_id, true).await?;
    Ok(Json(serde_json::json!({ "unloaded": unloaded })))
}

async fn chat_completions(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Response, SchedulerError> {
    proxy_openai_request(state, "/v1/chat/completions", body).await
}

async fn completions(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Response, SchedulerError> {
    proxy_openai_request(state, "/v1/completions", body).await
}

async fn embeddings(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Response, SchedulerError> {
    proxy_openai_request(state, "/v1/embeddings", body).await
}

/// Resolves `body.model`, admits the Process, and streams the upstream
/// response back verbatim (status, headers, body).
async fn proxy_openai_request(state: AppState, path: &str, mut body: Value) -> Result<Response, SchedulerError> {
    let requested = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| SchedulerError::ConfigInvalid("request body missing 'model'".to_string()))?
        .to_string();

    let start = Instant::now();
    let handle = state.scheduler.route(&requested).await?;

    let config = state.scheduler.config();
    if let Some(model) = config.models.get(&handle.process.model_id)
        && let Some(rename) = &model.use_model_name
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("model".to_string(), Value::String(rename.clone()));
    }

    let url = format!("{}{path}", state.scheduler.proxy_url(&handle.process));
    let upstream = state
        .http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|_| SchedulerError::UpstreamGone { model: handle.process.model_id.clone() })?;

    let latency_ms = start.elapsed().as_millis() as u64;
    state.scheduler.events().publish(BusEvent::Metrics {
        records: vec![MetricRecord {
            model: handle.process.model_id.clone(),
            group: handle.process.group_id.clone(),
            outcome: "ok",
            latency_ms,
        }],
    });

    stream_upstream_response(upstream)
}

fn stream_upstream_response(upstream: reqwest::Response) -> Result<Response, SchedulerError> {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .cloned();
    let stream = upstream.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));

    let mut response = Response::builder().status(status);
    if let Some(ct) = content_type {
        response = response.header(axum::http::header::CONTENT_TYPE, ct);
    }
    response
        .body(Body::from_stream(stream))
        .map_err(|e| SchedulerError::Other(anyhow::anyhow!(e)))
}

async fn upstream_get(
    State(state): State<AppState>,
    Path((model_id, rest)): Path<(String, String)>,
) -> Result<Response, SchedulerError> {
    upstream_passthrough(state, model_id, rest, reqwest::Method::GET, None).await
}

async fn upstream_post(
    State(state): State<AppState>,
    Path((model_id, rest)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, SchedulerError> {
    upstream_passthrough(state, model_id, rest, reqwest::Method::POST, Some(body)).await
}

async fn upstream_passthrough(
    state: AppState,
    model_id: String,
    rest: String,
    method: reqwest::Method,
    body: Option<axum::body::Bytes>,
) -> Result<Response, SchedulerError> {
    let handle = state.scheduler.route(&model_id).await?;
    let url = format!("{}/{rest}", state.scheduler.proxy_url(&handle.process));

    let mut req = state.http.request(method, &url);
    if let Some(body) = body {
        req = req.body(body);
    }
    let upstream = req
        .send()
        .await
        .map_err(|_| SchedulerError::UpstreamGone { model: handle.process.model_id.clone() })?;

    stream_upstream_response(upstream)
}

/// SSE stream of the Event Bus, one JSON frame per event, merged across
/// every topic's own channel. A lagging topic is resumed transparently by
/// `Subscription::recv` (it only ever drops the oldest entry on its own
/// channel, never another topic's pending event).
async fn events_sse(State(state): State<AppState>) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let subscription = state.scheduler.events().subscribe();
    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await;
        let frame = serde_json::to_string(&event).ok().map(|json| Ok(SseEvent::default().data(json)));
        frame.map(|frame| (frame, subscription))
    });
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Opaque forwarding to an external Config Producer. This crate has no
/// built-in config-generation tooling, so without a configured producer
/// every call here reports `Unavailable` rather than silently no-opping.
async fn config_forward(Path(_rest): Path<String>) -> impl IntoResponse {
    warn!("config producer endpoint invoked but no producer is configured");
    SchedulerError::Unavailable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;

    fn test_state() -> AppState {
        let config = Config::parse(
            r#"
models:
  visible:
    cmd: "/bin/sleep ${PORT}"
"#,
        )
        .unwrap();
        AppState {
            scheduler: Scheduler::new(config, reqwest::Client::new(), EventBus::new()),
            http: reqwest::Client::new(),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn liveness_reports_ok_when_not_draining() {
        let state = test_state();
        let response = liveness(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn list_models_includes_configured_model() {
        let state = test_state();
        let Json(body) = list_models(State(state)).await;
        let data = body.get("data").unwrap().as_array().unwrap();
        let entry = data.iter().find(|m| m["id"] == "visible").expect("configured model listed");
        assert_eq!(entry["state"], Value::Null);
        assert_eq!(entry["size_hint_bytes"], Value::Null);
    }

    #[tokio::test]
    async fn chat_completions_without_model_field_is_config_invalid() {
        let state = test_state();
        let result = proxy_openai_request(state, "/v1/chat/completions", serde_json::json!({})).await;
        assert!(matches!(result, Err(SchedulerError::ConfigInvalid(_))));
    }
}
