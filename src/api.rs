use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    error::PipelineError,
    ingest::{IndexStatus, StartOutcome},
    models::{ChatTurn, QueryResult},
};

type ApiError = (StatusCode, Json<Value>);

/// Tamaño máximo del cuerpo (consulta + historial de chat).
const MAX_BODY_SIZE: usize = 256 * 1024;

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct IndexPayload {
    #[serde(default)]
    force_reindex: bool,
}

#[derive(Deserialize)]
pub struct QueryPayload {
    query: String,
    #[serde(default)]
    chat_history: Vec<ChatTurn>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/index", post(index_handler))
        .route("/api/index/status", get(index_status_handler))
        .route("/api/query", post(query_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(app_state)
}

fn pipeline_error(err: &PipelineError) -> ApiError {
    let status = match err {
        PipelineError::Configuration(_) | PipelineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": err.to_string(), "kind": err.kind() })))
}

async fn indexed_chunks(state: &AppState) -> Result<usize, ApiError> {
    state.index.count().await.map_err(|e| {
        error!("No se pudo contar los chunks indexados: {}", e);
        pipeline_error(&e)
    })
}

// --- Handlers ---

#[axum::debug_handler]
async fn root_handler() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let (owner, name) = state.repo.owner_and_name();
    // La comprobación de vida no depende del estado del índice.
    let indexed_chunks = state.index.count().await.ok();
    Json(json!({
        "status": "ok",
        "repository": {
            "url": state.repo.base_url(),
            "branch": state.repo.branch(),
            "owner": owner,
            "name": name,
        },
        "models": {
            "chat": state.config.llm_chat_model,
            "embedding": state.config.llm_embedding_model,
        },
        "indexed_chunks": indexed_chunks,
        "indexing_in_progress": state.jobs.is_running(),
    }))
}

#[axum::debug_handler]
async fn index_handler(
    State(state): State<AppState>,
    payload: Option<Json<IndexPayload>>,
) -> Result<impl IntoResponse, ApiError> {
    let force_reindex = payload.map(|Json(p)| p.force_reindex).unwrap_or(false);

    if !force_reindex && !state.jobs.is_running() {
        let chunks = indexed_chunks(&state).await?;
        if chunks > 0 {
            info!("Índice ya poblado ({chunks} chunks); usa force_reindex para reindexar.");
            let job = match state.jobs.get_status() {
                IndexStatus::Job(job) => Some(job),
                IndexStatus::NeverIndexed => None,
            };
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "already_indexed",
                    "indexed_chunks": chunks,
                    "job": job,
                })),
            ));
        }
    }

    let body = match state.jobs.start_index() {
        StartOutcome::Started(job) => json!({ "status": "started", "job": job }),
        StartOutcome::AlreadyRunning(job) => json!({ "status": "already_running", "job": job }),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[axum::debug_handler]
async fn index_status_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let chunks = indexed_chunks(&state).await?;
    let mut body = match state.jobs.get_status() {
        IndexStatus::NeverIndexed => json!({ "state": "never_indexed" }),
        IndexStatus::Job(job) => serde_json::to_value(job).map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })?,
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("indexed_chunks".into(), json!(chunks));
        obj.insert("previous_job".into(), json!(state.jobs.previous_job()));
    }
    Ok(Json(body))
}

#[axum::debug_handler]
async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> Result<Json<QueryResult>, ApiError> {
    let query = payload.query.trim();
    if query.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "La consulta no puede estar vacía." })),
        ));
    }

    if indexed_chunks(&state).await? == 0 {
        let message = if state.jobs.is_running() {
            "La indexación del repositorio está en curso; inténtalo de nuevo en unos momentos."
        } else {
            "El repositorio todavía no está indexado. Lanza POST /api/index primero."
        };
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": message,
                "indexing_in_progress": state.jobs.is_running(),
            })),
        ));
    }

    info!("Consulta recibida: {}", query);
    state
        .workflow
        .run(query, &payload.chat_history)
        .await
        .map(Json)
        .map_err(|e| pipeline_error(&e))
}
