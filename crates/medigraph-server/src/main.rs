use anyhow::Context;
use axum::{
    routing::{get, post},
    Json, Router,
};
use medigraph_common::config::{mask_secret, AppConfig};
use medigraph_core::MediGraphEngine;
use moka::future::Cache;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

mod dashboard;

struct AppState {
    engine: MediGraphEngine,
    start_time: Instant,
    /// Warehouse summary and graph stats. Cleared after every load.
    dashboard_cache: Cache<String, serde_json::Value>,
}

impl AppState {
    fn new(engine: MediGraphEngine) -> Self {
        let ttl = engine.config().server.cache_ttl_secs;
        Self {
            engine,
            start_time: Instant::now(),
            dashboard_cache: Cache::builder()
                .time_to_live(Duration::from_secs(ttl))
                .max_capacity(100)
                .build(),
        }
    }
}

/// First directory that holds the dashboard's `index.html`.
fn dashboard_dir(config: &AppConfig) -> PathBuf {
    config
        .server
        .static_dir
        .iter()
        .map(PathBuf::from)
        .chain(
            ["static/dashboard", "crates/medigraph-server/static/dashboard"]
                .iter()
                .map(PathBuf::from),
        )
        .chain(std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("static/dashboard"))))
        .find(|p| p.join("index.html").exists())
        .unwrap_or_else(|| PathBuf::from("static/dashboard"))
}

fn app(state: Arc<AppState>, static_dir: PathBuf) -> Router {
    let dashboard_routes = Router::new()
        .route("/status", get(dashboard::handlers::status))
        .route("/warehouse/summary", get(dashboard::handlers::warehouse_summary))
        .route("/graph/stats", get(dashboard::handlers::graph_stats))
        .route("/graph", get(dashboard::handlers::graph_data))
        .route("/patients/:patient_id/journey", get(dashboard::handlers::patient_journey))
        .route("/load", post(dashboard::handlers::load))
        .route("/ask", post(dashboard::handlers::ask))
        .route("/query", post(dashboard::handlers::structured_query))
        .route("/config", get(dashboard::handlers::get_config))
        .route("/version", get(dashboard::handlers::version));

    let dashboard_static = ServeDir::new(static_dir).append_index_html_on_directories(true);

    Router::new()
        .route("/", get(root))
        .nest("/v1/dashboard", dashboard_routes)
        .nest_service("/dashboard", dashboard_static)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "medigraph",
        "dashboard": "/dashboard/",
        "api": "/v1/dashboard",
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    match dotenvy::dotenv() {
        Ok(path) => tracing::info!("Loaded .env from: {:?}", path),
        Err(e) => tracing::warn!("Failed to load .env file: {}. Using system environment variables.", e),
    }

    let config = AppConfig::load().context("Failed to load configuration")?;
    tracing::info!("Running in {:?} mode", config.server.mode);
    match config.get_active_key() {
        Some(key) => tracing::info!(
            "Generation API key loaded for {:?} ({})",
            config.llm.provider,
            mask_secret(&key)
        ),
        None => tracing::info!("No generation API key configured"),
    }

    let http_addr: SocketAddr = config
        .server
        .http_addr
        .parse()
        .with_context(|| format!("Invalid server.http_addr: {}", config.server.http_addr))?;
    let static_dir = dashboard_dir(&config);
    tracing::info!("Dashboard static dir: {:?} (exists: {})", static_dir, static_dir.exists());

    let engine = MediGraphEngine::connect(config).await?;
    let state = Arc::new(AppState::new(engine));

    let health = state.engine.health().await;
    if !health.ok() {
        tracing::warn!(
            "Starting with degraded backends (warehouse ok: {}, graph ok: {})",
            health.warehouse.ok,
            health.graph.ok
        );
    }

    let app = app(state, static_dir);

    tracing::info!("HTTP API listening on {}", http_addr);
    tracing::info!("Dashboard available at http://{}/dashboard/", http_addr);
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", e);
            }
            tracing::info!("Shutdown signal received.");
        })
        .await?;

    tracing::info!("MediGraph server stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn demo_app() -> Router {
        let state = Arc::new(AppState::new(MediGraphEngine::demo(AppConfig::default())));
        app(state, PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/static/dashboard")))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_status_reports_demo_backends() {
        let app = demo_app();
        let (status, body) = get_json(&app, "/v1/dashboard/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "demo");
        assert_eq!(body["ok"], true);
        assert_eq!(body["warehouse"]["backend"], "fixture");
        assert_eq!(body["warehouse"]["row_counts"]["V_PATIENTS"], 5);
        assert_eq!(body["graph"]["node_counts"]["patients"], 0);
        assert_eq!(body["loading"], false);
    }

    #[tokio::test]
    async fn test_warehouse_summary() {
        let app = demo_app();
        let (status, body) = get_json(&app, "/v1/dashboard/warehouse/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["row_counts"]["V_ENCOUNTERS"], 5);
        assert_eq!(body["sample_patients"].as_array().unwrap().len(), 5);
        assert_eq!(body["sample_patients"][0]["PATIENT_ID"], "P001");
    }

    #[tokio::test]
    async fn test_load_invalidates_cached_stats() {
        let app = demo_app();
        let (_, before) = get_json(&app, "/v1/dashboard/graph/stats").await;
        assert_eq!(before["node_counts"]["patients"], 0);

        let (status, body) = post_json(&app, "/v1/dashboard/load", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes_created"], 21);
        assert_eq!(body["report"]["entities"].as_array().unwrap().len(), 6);

        let (_, after) = get_json(&app, "/v1/dashboard/graph/stats").await;
        assert_eq!(after["node_counts"]["patients"], 5);
        assert!(!after["relationships"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_selected_entities_with_cap() {
        let app = demo_app();
        let (status, body) = post_json(
            &app,
            "/v1/dashboard/load",
            json!({ "entities": ["patients"], "max_rows": 2, "skip_policy": "never" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let patients = &body["report"]["entities"][0];
        assert_eq!(patients["entity"], "Patient");
        assert_eq!(patients["nodes_created"], 2);
        assert_eq!(patients["rows_not_loaded"], 3);
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_entity() {
        let app = demo_app();
        let (status, body) = post_json(&app, "/v1/dashboard/load", json!({ "entities": ["claims"] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("claims"));
    }

    #[tokio::test]
    async fn test_ask_routes_without_llm() {
        let app = demo_app();
        let (status, body) = post_json(&app, "/v1/dashboard/ask", json!({ "question": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        post_json(&app, "/v1/dashboard/load", json!({})).await;
        let (status, body) = post_json(&app, "/v1/dashboard/ask", json!({ "question": "show patients with diabetes" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "router");
        assert_eq!(body["rows"].as_array().unwrap().len(), 3);
        assert_eq!(body["fallback"], false);
    }

    #[tokio::test]
    async fn test_structured_query() {
        let app = demo_app();
        post_json(&app, "/v1/dashboard/load", json!({})).await;
        let (status, body) = post_json(
            &app,
            "/v1/dashboard/query",
            json!({ "kind": "medications_for_patient", "patient_id": "P004" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "structured");
        assert_eq!(body["columns"], json!(["patient_id", "full_name", "rxnorm", "medication"]));
        assert_eq!(body["rows"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_patient_journey() {
        let app = demo_app();
        let (status, _) = get_json(&app, "/v1/dashboard/patients/P001/journey").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        post_json(&app, "/v1/dashboard/load", json!({})).await;
        let (status, body) = get_json(&app, "/v1/dashboard/patients/p001/journey?limit=50").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["patient_id"], "P001");
        let nodes = body["nodes"].as_array().unwrap();
        let patient = nodes.iter().find(|n| n["id"] == "Patient:P001").unwrap();
        assert_eq!(patient["color"], "#22d3ee");
        assert!(!body["edges"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_graph_sample_respects_limit() {
        let app = demo_app();
        post_json(&app, "/v1/dashboard/load", json!({})).await;
        let (status, body) = get_json(&app, "/v1/dashboard/graph?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["edges"].as_array().unwrap().len(), 5);
        assert_eq!(body["stats"]["edge_count"], 5);
    }

    #[tokio::test]
    async fn test_config_is_redacted() {
        let mut config = AppConfig::default();
        config.graph.password = Some("hunter2".into());
        config.llm.openai_api_key = Some("sk-test".into());
        let state = Arc::new(AppState::new(MediGraphEngine::demo(config)));
        let app = app(state, PathBuf::from("static/dashboard"));

        let (status, body) = get_json(&app, "/v1/dashboard/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["graph"]["password"], "***");
        assert_eq!(body["mode"], "demo");
        assert!(!body.to_string().contains("sk-test"));
    }

    #[tokio::test]
    async fn test_version_and_static_dashboard() {
        let app = demo_app();
        let (status, body) = get_json(&app, "/v1/dashboard/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/dashboard/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
