use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use medigraph_common::config::SkipPolicy;
use medigraph_common::{EntityKind, NodeRef, GUIDELINE_LABEL};
use medigraph_core::query::HELP_TEXT;
use medigraph_core::{QueryAnswer, StructuredQuery};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{error_response, graph_view};

const SUMMARY_CACHE_KEY: &str = "warehouse_summary";
const STATS_CACHE_KEY: &str = "graph_stats";
const SAMPLE_PATIENTS: usize = 20;
const DEFAULT_GRAPH_LIMIT: usize = 300;
const MAX_GRAPH_LIMIT: usize = 1000;

// ── Status ────────────────────────────────────────────────────────

pub async fn status(State(state): State<Arc<crate::AppState>>) -> Json<serde_json::Value> {
    let health = state.engine.health().await;
    Json(json!({
        "mode": health.mode,
        "ok": health.ok(),
        "warehouse": health.warehouse,
        "graph": health.graph,
        "loading": state.engine.is_loading(),
        "generation_model": state.engine.query().generation_model(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ── Warehouse ─────────────────────────────────────────────────────

pub async fn warehouse_summary(State(state): State<Arc<crate::AppState>>) -> axum::response::Response {
    if let Some(cached) = state.dashboard_cache.get(SUMMARY_CACHE_KEY).await {
        return Json(cached).into_response();
    }

    let warehouse = state.engine.warehouse();
    let mut row_counts = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for kind in EntityKind::LOAD_ORDER {
        match warehouse.count_rows(kind).await {
            Ok(n) => {
                row_counts.insert(kind.view_name().to_string(), json!(n));
            }
            Err(e) => {
                tracing::warn!("Could not count {}: {:?}", kind.view_name(), e);
                errors.insert(kind.view_name().to_string(), json!(format!("{:#}", e)));
            }
        }
    }

    let patients = match warehouse.sample_patients(SAMPLE_PATIENTS).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("Patient sample failed: {:?}", e);
            return error_response(StatusCode::BAD_GATEWAY, format!("Could not read patients: {:#}", e));
        }
    };

    let complete = errors.is_empty();
    let result = json!({
        "backend": warehouse.name(),
        "row_counts": row_counts,
        "errors": errors,
        "sample_patients": patients,
    });
    if complete {
        state.dashboard_cache.insert(SUMMARY_CACHE_KEY.to_string(), result.clone()).await;
    }
    Json(result).into_response()
}

// ── Graph ─────────────────────────────────────────────────────────

pub async fn graph_stats(State(state): State<Arc<crate::AppState>>) -> axum::response::Response {
    if let Some(cached) = state.dashboard_cache.get(STATS_CACHE_KEY).await {
        return Json(cached).into_response();
    }

    let graph = state.engine.graph();
    let result: anyhow::Result<serde_json::Value> = async {
        let mut node_counts = serde_json::Map::new();
        for kind in EntityKind::LOAD_ORDER {
            node_counts.insert(kind.plural().to_string(), json!(graph.count_nodes(kind.as_str()).await?));
        }
        node_counts.insert("guidelines".to_string(), json!(graph.count_nodes(GUIDELINE_LABEL).await?));
        let relationships = graph.relationship_counts().await?;
        Ok(json!({
            "backend": graph.name(),
            "node_counts": node_counts,
            "relationships": relationships,
        }))
    }
    .await;

    match result {
        Ok(stats) => {
            state.dashboard_cache.insert(STATS_CACHE_KEY.to_string(), stats.clone()).await;
            Json(stats).into_response()
        }
        Err(e) => {
            tracing::error!("Graph stats failed: {:?}", e);
            error_response(StatusCode::BAD_GATEWAY, format!("Graph unavailable: {:#}", e))
        }
    }
}

fn default_graph_limit() -> usize {
    DEFAULT_GRAPH_LIMIT
}

#[derive(Deserialize)]
pub struct GraphQuery {
    #[serde(default = "default_graph_limit")]
    limit: usize,
}

pub async fn graph_data(
    State(state): State<Arc<crate::AppState>>,
    Query(params): Query<GraphQuery>,
) -> axum::response::Response {
    let limit = params.limit.clamp(1, MAX_GRAPH_LIMIT);
    match state.engine.graph().sample_edges(limit).await {
        Ok(edges) => Json(graph_view(&edges)).into_response(),
        Err(e) => {
            tracing::error!("Graph sample failed: {:?}", e);
            error_response(StatusCode::BAD_GATEWAY, format!("Graph unavailable: {:#}", e))
        }
    }
}

fn default_journey_limit() -> usize {
    medigraph_core::query::structured::DEFAULT_JOURNEY_LIMIT
}

#[derive(Deserialize)]
pub struct JourneyQuery {
    #[serde(default = "default_journey_limit")]
    limit: usize,
}

pub async fn patient_journey(
    State(state): State<Arc<crate::AppState>>,
    Path(patient_id): Path<String>,
    Query(params): Query<JourneyQuery>,
) -> axum::response::Response {
    let patient = NodeRef::entity(EntityKind::Patient, patient_id.trim().to_uppercase());
    let graph = state.engine.graph();

    match graph.node_exists(&patient).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(StatusCode::NOT_FOUND, format!("No graph found for patient {}", patient.key));
        }
        Err(e) => {
            tracing::error!("Patient lookup failed: {:?}", e);
            return error_response(StatusCode::BAD_GATEWAY, format!("Graph unavailable: {:#}", e));
        }
    }

    let limit = params.limit.clamp(1, MAX_GRAPH_LIMIT);
    match graph.neighbourhood(&patient, limit).await {
        Ok(edges) => {
            let mut view = graph_view(&edges);
            view["patient_id"] = json!(patient.key);
            view["rows"] = json!(edges);
            Json(view).into_response()
        }
        Err(e) => {
            tracing::error!("Journey query failed for {}: {:?}", patient, e);
            error_response(StatusCode::BAD_GATEWAY, format!("Graph unavailable: {:#}", e))
        }
    }
}

// ── Load ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoadRequest {
    /// Labels or plurals; empty means every kind.
    #[serde(default)]
    entities: Vec<String>,
    max_rows: Option<usize>,
    skip_policy: Option<SkipPolicy>,
}

pub async fn load(
    State(state): State<Arc<crate::AppState>>,
    Json(payload): Json<LoadRequest>,
) -> axum::response::Response {
    let kinds = if payload.entities.is_empty() {
        EntityKind::LOAD_ORDER.to_vec()
    } else {
        match payload
            .entities
            .iter()
            .map(|e| e.parse::<EntityKind>())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(kinds) => kinds,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        }
    };

    let mut options = state.engine.default_load_options();
    if let Some(max_rows) = payload.max_rows {
        options.max_rows = max_rows;
    }
    if let Some(policy) = payload.skip_policy {
        options.skip_policy = policy;
    }

    if state.engine.is_loading() {
        tracing::info!("A load is already running; this one waits for it");
    }
    let report = state.engine.load(&kinds, options).await;
    state.dashboard_cache.invalidate_all();

    Json(json!({
        "nodes_created": report.nodes_created(),
        "edges_created": report.edges_created(),
        "failed_rows": report.failed_rows(),
        "has_errors": report.has_errors(),
        "report": report,
    }))
    .into_response()
}

// ── Questions ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AskRequest {
    question: String,
}

pub async fn ask(
    State(state): State<Arc<crate::AppState>>,
    Json(payload): Json<AskRequest>,
) -> axum::response::Response {
    let question = payload.question.trim();
    if question.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "question is required", "help": HELP_TEXT })),
        )
            .into_response();
    }
    Json(state.engine.query().ask(question).await).into_response()
}

pub async fn structured_query(
    State(state): State<Arc<crate::AppState>>,
    Json(query): Json<StructuredQuery>,
) -> Json<QueryAnswer> {
    Json(state.engine.query().run_structured(&query).await)
}

// ── Config ────────────────────────────────────────────────────────

pub async fn get_config(State(state): State<Arc<crate::AppState>>) -> Json<serde_json::Value> {
    let mut result = state.engine.config().redacted();
    result["mode"] = json!(state.engine.mode());
    result["generation_model"] = json!(state.engine.query().generation_model());
    Json(result)
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build_time": env!("BUILD_TIME"),
        "commit": env!("GIT_COMMIT"),
        "features": ["etl", "text-to-cypher", "phrase-router", "guidelines", "dashboard"],
    }))
}
