use anyhow::{Result, bail};
use medigraph_common::config::{AppConfig, RunMode};
use medigraph_common::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::etl::{EtlLoader, EtlReport, LoadOptions};
use crate::graph::{BoltGraph, GraphStore, MemoryGraph};
use crate::llm::create_llm_client;
use crate::query::QueryService;
use crate::seed::{seed_guidelines, SeedReport};
use crate::warehouse::{FixtureWarehouse, SqlApiWarehouse, Warehouse, WarehouseInfo};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarehouseHealth {
    pub backend: String,
    pub ok: bool,
    pub session: Option<WarehouseInfo>,
    /// Rows per view; views that could not be counted are absent.
    pub row_counts: BTreeMap<String, u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphHealth {
    pub backend: String,
    pub ok: bool,
    pub node_counts: BTreeMap<String, u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub mode: RunMode,
    pub warehouse: WarehouseHealth,
    pub graph: GraphHealth,
}

impl HealthReport {
    pub fn ok(&self) -> bool {
        self.warehouse.ok && self.graph.ok
    }
}

/// The wired-up system: one warehouse, one graph and the query service on
/// top of them. Cheap to clone.
#[derive(Clone)]
pub struct MediGraphEngine {
    config: Arc<AppConfig>,
    mode: RunMode,
    warehouse: Arc<dyn Warehouse>,
    graph: Arc<dyn GraphStore>,
    query: QueryService,
    load_lock: Arc<Mutex<()>>,
}

impl MediGraphEngine {
    pub fn new(config: AppConfig, mode: RunMode, warehouse: Arc<dyn Warehouse>, graph: Arc<dyn GraphStore>) -> Self {
        let llm = create_llm_client(&config);
        match &llm {
            Some(client) => tracing::info!("Question answering uses {:?} model {}", client.provider(), client.model()),
            None => tracing::info!("No generation API key set; questions go through the phrase router"),
        }
        let query = QueryService::new(graph.clone(), llm);
        Self {
            config: Arc::new(config),
            mode,
            warehouse,
            graph,
            query,
            load_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Fixture rows and an empty in-process graph.
    pub fn demo(config: AppConfig) -> Self {
        Self::new(
            config,
            RunMode::Demo,
            Arc::new(FixtureWarehouse::demo()),
            Arc::new(MemoryGraph::new()),
        )
    }

    /// Builds the engine for the configured mode. Live mode fails up front,
    /// naming every missing setting.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        match config.server.mode {
            RunMode::Demo => Ok(Self::demo(config)),
            RunMode::Live => {
                let missing = config.missing_live_settings();
                if !missing.is_empty() {
                    bail!("Live mode needs these settings: {}", missing.join(", "));
                }
                let warehouse = SqlApiWarehouse::from_config(&config)?;
                let graph = BoltGraph::from_config(&config.graph).await?;
                Ok(Self::new(config, RunMode::Live, Arc::new(warehouse), Arc::new(graph)))
            }
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn default_load_options(&self) -> LoadOptions {
        LoadOptions::from(&self.config.etl)
    }

    pub fn is_loading(&self) -> bool {
        self.load_lock.try_lock().is_err()
    }

    /// Runs the loader. Concurrent calls wait for the running pass to finish.
    pub async fn load(&self, kinds: &[EntityKind], options: LoadOptions) -> EtlReport {
        let _guard = self.load_lock.lock().await;
        EtlLoader::new(self.warehouse.clone(), self.graph.clone(), options)
            .run_kinds(kinds)
            .await
    }

    pub async fn seed_guidelines(&self) -> Result<SeedReport> {
        let _guard = self.load_lock.lock().await;
        seed_guidelines(self.graph.as_ref()).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            mode: self.mode,
            warehouse: self.warehouse_health().await,
            graph: self.graph_health().await,
        }
    }

    async fn warehouse_health(&self) -> WarehouseHealth {
        let mut health = WarehouseHealth {
            backend: self.warehouse.name().to_string(),
            ok: false,
            session: None,
            row_counts: BTreeMap::new(),
            error: None,
        };
        match self.warehouse.ping().await {
            Ok(info) => {
                health.ok = true;
                health.session = Some(info);
            }
            Err(e) => {
                tracing::warn!("Warehouse check failed: {:?}", e);
                health.error = Some(format!("{:#}", e));
                return health;
            }
        }
        for kind in EntityKind::LOAD_ORDER {
            match self.warehouse.count_rows(kind).await {
                Ok(n) => {
                    health.row_counts.insert(kind.view_name().to_string(), n);
                }
                Err(e) => tracing::debug!("Count of {} skipped: {:?}", kind.view_name(), e),
            }
        }
        health
    }

    async fn graph_health(&self) -> GraphHealth {
        let mut health = GraphHealth {
            backend: self.graph.name().to_string(),
            ok: false,
            node_counts: BTreeMap::new(),
            error: None,
        };
        let checked = async {
            self.graph.ping().await?;
            let mut counts = BTreeMap::new();
            for kind in EntityKind::LOAD_ORDER {
                counts.insert(kind.plural().to_string(), self.graph.count_nodes(kind.as_str()).await?);
            }
            anyhow::Ok(counts)
        };
        match checked.await {
            Ok(counts) => {
                health.ok = true;
                health.node_counts = counts;
            }
            Err(e) => {
                tracing::warn!("Graph check failed: {:?}", e);
                health.error = Some(format!("{:#}", e));
            }
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_engine_health_and_load() {
        let engine = MediGraphEngine::demo(AppConfig::default());
        assert_eq!(engine.mode(), RunMode::Demo);

        let before = engine.health().await;
        assert!(before.ok());
        assert_eq!(before.warehouse.row_counts["V_PATIENTS"], 5);
        assert_eq!(before.graph.node_counts["patients"], 0);

        let report = engine.load(&EntityKind::LOAD_ORDER, engine.default_load_options()).await;
        assert_eq!(report.get(EntityKind::Patient).unwrap().nodes_created, 5);
        assert!(!engine.is_loading());

        let after = engine.health().await;
        assert_eq!(after.graph.node_counts["encounters"], 5);
    }

    #[tokio::test]
    async fn test_live_mode_reports_missing_settings() {
        let mut config = AppConfig::default();
        config.server.mode = RunMode::Live;
        config.warehouse.account = Some("xy12345".into());
        let err = MediGraphEngine::connect(config).await.err().unwrap().to_string();
        assert!(err.contains("SNOWFLAKE_TOKEN"));
        assert!(err.contains("NEO4J_PASSWORD"));
        assert!(!err.contains("SNOWFLAKE_ACCOUNT"));
    }

    #[tokio::test]
    async fn test_demo_answers_without_llm() {
        let engine = MediGraphEngine::demo(AppConfig::default());
        engine.load(&EntityKind::LOAD_ORDER, engine.default_load_options()).await;
        let answer = engine.query().ask("show patients with diabetes").await;
        assert_eq!(answer.rows.len(), 3);
    }
}
