//! Warehouse-to-graph loader.
//!
//! Kinds are processed in [`EntityKind::LOAD_ORDER`] so that every node a row
//! refers to has had its chance to load first. A row whose references are
//! missing is rejected as a whole; the loader never invents endpoints.

pub mod records;

pub use records::{EntityRecord, RowError};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use medigraph_common::config::{EtlConfig, SkipPolicy};
use medigraph_common::{EntityKind, NodeRef, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use crate::graph::{EdgeWrite, GraphStore};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_rows: usize,
    pub skip_policy: SkipPolicy,
    pub progress_every: usize,
}

impl From<&EtlConfig> for LoadOptions {
    fn from(config: &EtlConfig) -> Self {
        Self {
            max_rows: config.max_rows_per_entity,
            skip_policy: config.skip_policy,
            progress_every: config.progress_every,
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from(&EtlConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowFailure {
    pub row_key: String,
    pub reason: String,
}

/// What happened to one entity kind during a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub entity: EntityKind,
    pub rows_available: u64,
    pub rows_fetched: u64,
    /// Rows left behind by the cap.
    pub rows_not_loaded: u64,
    pub rows_loaded: u64,
    pub nodes_created: u64,
    pub edges_created: u64,
    pub failures: Vec<RowFailure>,
    pub skipped: bool,
    /// Set when the warehouse or the graph failed for this kind.
    pub error: Option<String>,
}

impl LoadReport {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            rows_available: 0,
            rows_fetched: 0,
            rows_not_loaded: 0,
            rows_loaded: 0,
            nodes_created: 0,
            edges_created: 0,
            failures: Vec::new(),
            skipped: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub max_rows: usize,
    pub skip_policy: SkipPolicy,
    pub entities: Vec<LoadReport>,
}

impl EtlReport {
    pub fn get(&self, kind: EntityKind) -> Option<&LoadReport> {
        self.entities.iter().find(|r| r.entity == kind)
    }

    pub fn nodes_created(&self) -> u64 {
        self.entities.iter().map(|r| r.nodes_created).sum()
    }

    pub fn edges_created(&self) -> u64 {
        self.entities.iter().map(|r| r.edges_created).sum()
    }

    pub fn failed_rows(&self) -> usize {
        self.entities.iter().map(|r| r.failures.len()).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.entities.iter().any(|r| r.error.is_some())
    }
}

enum RowOutcome {
    Loaded,
    Rejected(RowError),
}

pub struct EtlLoader {
    warehouse: Arc<dyn Warehouse>,
    graph: Arc<dyn GraphStore>,
    options: LoadOptions,
}

impl EtlLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, graph: Arc<dyn GraphStore>, options: LoadOptions) -> Self {
        Self { warehouse, graph, options }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Full pass over every kind.
    pub async fn run(&self) -> EtlReport {
        self.run_kinds(&EntityKind::LOAD_ORDER).await
    }

    /// Loads the given kinds, always in load order regardless of how they
    /// are listed.
    pub async fn run_kinds(&self, kinds: &[EntityKind]) -> EtlReport {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        tracing::info!(
            "ETL run {} started: max_rows={}, skip_policy={:?}, warehouse={}, graph={}",
            run_id,
            self.options.max_rows,
            self.options.skip_policy,
            self.warehouse.name(),
            self.graph.name()
        );

        if let Err(e) = self.graph.ensure_schema().await {
            tracing::warn!("Could not ensure graph constraints: {:?}", e);
        }

        let mut entities = Vec::new();
        for kind in EntityKind::LOAD_ORDER.into_iter().filter(|k| kinds.contains(k)) {
            entities.push(self.load_entity(kind).await);
        }

        let report = EtlReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            max_rows: self.options.max_rows,
            skip_policy: self.options.skip_policy,
            entities,
        };
        tracing::info!(
            "ETL run {} finished: {} nodes and {} edges created, {} rows rejected",
            run_id,
            report.nodes_created(),
            report.edges_created(),
            report.failed_rows()
        );
        report
    }

    /// Loads one kind. A warehouse or graph failure stops the kind and is
    /// recorded on the report, which keeps the counts of what was already
    /// written.
    pub async fn load_entity(&self, kind: EntityKind) -> LoadReport {
        let mut report = LoadReport::new(kind);
        if let Err(e) = self.fill_report(kind, &mut report).await {
            tracing::error!(
                "Loading {} failed after {} rows: {:?}",
                kind.plural(),
                report.rows_loaded,
                e
            );
            report.error = Some(format!("{:#}", e));
        }
        report
    }

    async fn fill_report(&self, kind: EntityKind, report: &mut LoadReport) -> Result<()> {
        if self.options.skip_policy == SkipPolicy::LabelPresent {
            let existing = self.graph.count_nodes(kind.as_str()).await?;
            if existing > 0 {
                tracing::info!("Skipping {}: {} nodes already in the graph", kind.plural(), existing);
                report.skipped = true;
                return Ok(());
            }
        }

        report.rows_available = self.warehouse.count_rows(kind).await?;
        let mut rows = self.warehouse.fetch_rows(kind, self.options.max_rows).await?;
        rows.truncate(self.options.max_rows);
        report.rows_fetched = rows.len() as u64;
        report.rows_not_loaded = report.rows_available.saturating_sub(report.rows_fetched);

        tracing::info!(
            "Loading {}: {} of {} rows (cap {})",
            kind.plural(),
            report.rows_fetched,
            report.rows_available,
            self.options.max_rows
        );

        let mut present: HashSet<NodeRef> = HashSet::new();
        for (i, row) in rows.iter().enumerate() {
            match self.load_row(kind, row, &mut present, report).await? {
                RowOutcome::Loaded => report.rows_loaded += 1,
                RowOutcome::Rejected(reason) => {
                    let row_key = records::row_key(kind, row);
                    tracing::warn!("Rejected {} row {}: {}", kind, row_key, reason);
                    report.failures.push(RowFailure { row_key, reason: reason.to_string() });
                }
            }
            if self.options.progress_every > 0 && (i + 1) % self.options.progress_every == 0 {
                tracing::info!("{}: {}/{} rows processed", kind.plural(), i + 1, rows.len());
            }
        }

        tracing::info!(
            "Loaded {}: {} rows, {} nodes created, {} edges created, {} rejected, {} not loaded",
            kind.plural(),
            report.rows_loaded,
            report.nodes_created,
            report.edges_created,
            report.failures.len(),
            report.rows_not_loaded
        );
        Ok(())
    }

    async fn load_row(
        &self,
        kind: EntityKind,
        row: &Row,
        present: &mut HashSet<NodeRef>,
        report: &mut LoadReport,
    ) -> Result<RowOutcome> {
        let record = match records::transform(kind, row) {
            Ok(record) => record,
            Err(e) => return Ok(RowOutcome::Rejected(e)),
        };

        for reference in record.referenced_nodes() {
            if present.contains(&reference) {
                continue;
            }
            if !self.graph.node_exists(&reference).await? {
                return Ok(RowOutcome::Rejected(RowError::MissingReference { reference }));
            }
            present.insert(reference);
        }

        if self.graph.merge_node(&record.node).await? {
            report.nodes_created += 1;
        }
        present.insert(record.node.reference());

        for edge in &record.edges {
            match self.graph.merge_edge(edge).await? {
                EdgeWrite::Created => report.edges_created += 1,
                EdgeWrite::Existing => {}
                EdgeWrite::MissingEndpoint => {
                    return Err(anyhow!(
                        "{} -[{}]-> {} lost an endpoint during the load",
                        edge.source,
                        edge.relation,
                        edge.target
                    ));
                }
            }
        }
        Ok(RowOutcome::Loaded)
    }
}
