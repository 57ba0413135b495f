use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::engine::{
    error::EngineError, executor::ExecutionEngine, models::ExecutionRequest,
    models::LanguageInfo,
};

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    code: String,
    language: String,
    #[serde(default, alias = "stdin")]
    input: String,
}

pub fn routes(engine: ExecutionEngine) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/languages", get(languages))
        .route("/v1/execute", post(execute))
        .with_state(engine)
}

async fn health(State(engine): State<ExecutionEngine>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "backend": engine.backend_name(),
        "activeSandboxes": engine.registry().active_count(),
    }))
}

async fn metrics(State(engine): State<ExecutionEngine>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        engine.metrics().render_prometheus(),
    )
}

async fn languages(State(engine): State<ExecutionEngine>) -> Json<Vec<LanguageInfo>> {
    Json(engine.languages())
}

/// One SSE `data:` frame per event; the stream closes after the terminal
/// event. A dropped connection drops the subscription and so cancels the run.
async fn execute(
    State(engine): State<ExecutionEngine>,
    Json(body): Json<ExecuteBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, EngineError> {
    let subscription = engine.submit(ExecutionRequest::new(body.code, body.language, body.input))?;
    let events = subscription.map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
