use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, Router, routing::{get, post}};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::agent::engine::TurnEvent;
use crate::controller::{ChatController, ThreadSummary};
use crate::settings::{LoopPolicy, ModelParams, RequestOverrides};
use crate::thread::DisplayMessage;

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    /// Held for a whole turn, so submissions run one at a time.
    pub controller: Arc<Mutex<ChatController>>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(controller: ChatController, metrics: Option<PrometheusHandle>) -> Self {
        Self { controller: Arc::new(Mutex::new(controller)), metrics }
    }
}

#[derive(Debug, Serialize)]
pub struct NewThreadResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ListThreadsResponse {
    pub threads: Vec<ThreadSummary>,
}

#[derive(Debug, Serialize)]
pub struct ThreadResponse {
    pub id: String,
    pub messages: Vec<DisplayMessage>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub content: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_steps: Option<u32>,
}

impl SubmitBody {
    fn overrides(&self) -> RequestOverrides {
        RequestOverrides {
            model: self.model.clone(),
            model_params: Some(ModelParams { temperature: self.temperature, max_tokens: self.max_tokens, top_p: None }),
            loop_policy: Some(LoopPolicy { max_steps: self.max_steps, ..Default::default() }),
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn new_thread(State(state): State<AppState>) -> Json<NewThreadResponse> {
    let mut c = state.controller.lock().await;
    Json(NewThreadResponse { id: c.new_chat().to_string() })
}

async fn list_threads(State(state): State<AppState>) -> Json<ListThreadsResponse> {
    let c = state.controller.lock().await;
    Json(ListThreadsResponse { threads: c.sidebar().await })
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> Json<ThreadResponse> {
    let mut c = state.controller.lock().await;
    let messages = c.select_thread(&id).await.to_vec();
    Json(ThreadResponse { id, messages })
}

async fn delete_thread(State(state): State<AppState>, Path(id): Path<String>) -> (StatusCode, Json<DeleteResponse>) {
    let mut c = state.controller.lock().await;
    let deleted = c.delete_thread(&id).await;
    let status = if deleted { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (status, Json(DeleteResponse { deleted }))
}

fn turn_event_to_sse(ev: &TurnEvent) -> Event {
    let kind = match ev {
        TurnEvent::Fragment { .. } => "fragment",
        TurnEvent::Message { .. } => "message",
        TurnEvent::Done { .. } => "done",
        TurnEvent::Failed { .. } => "error",
    };
    let data = serde_json::to_value(ev).unwrap_or_default();
    Event::default().event(kind).data(data.to_string())
}

async fn submit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Response {
    if body.content.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "empty message").into_response();
    }
    let mut controller = state.controller.clone().lock_owned().await;
    if controller.current_thread() != id {
        controller.select_thread(&id).await;
    }
    let mut turn = controller.submit(&body.content, body.overrides()).await;
    let stream = async_stream::stream! {
        while let Some(ev) = turn.next().await {
            let last = matches!(ev, TurnEvent::Done { .. } | TurnEvent::Failed { .. });
            if last {
                controller.finish_turn(&ev);
            }
            yield Ok::<Event, Infallible>(turn_event_to_sse(&ev));
            if last {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1/threads", post(new_thread).get(list_threads))
        .route("/v1/threads/:id", get(get_thread).delete(delete_thread))
        .route("/v1/threads/:id/messages", post(submit_message))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
