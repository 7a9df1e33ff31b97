//! Read access to the tabular views the graph is built from.

pub mod fixture;
pub mod sql_api;

pub use fixture::FixtureWarehouse;
pub use sql_api::SqlApiWarehouse;

use anyhow::Result;
use async_trait::async_trait;
use medigraph_common::{EntityKind, Row};
use serde::{Deserialize, Serialize};

/// Session details reported by a successful connectivity check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WarehouseInfo {
    pub account: Option<String>,
    pub region: Option<String>,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<WarehouseInfo>;

    /// Rows the view would return without a cap.
    async fn count_rows(&self, kind: EntityKind) -> Result<u64>;

    /// At most `limit` rows of the view backing `kind`.
    async fn fetch_rows(&self, kind: EntityKind, limit: usize) -> Result<Vec<Row>>;

    async fn sample_patients(&self, limit: usize) -> Result<Vec<Row>> {
        self.fetch_rows(EntityKind::Patient, limit).await
    }
}

/// Columns selected from each view, in select order.
pub fn columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Patient => &["PATIENT_ID", "FIRST_NAME", "LAST_NAME", "SEX", "ZIP", "AGE"],
        EntityKind::Provider => &["PROVIDER_ID", "PROVIDER_NAME", "SPECIALTY", "STATE", "ZIP"],
        EntityKind::Encounter => &["ENC_ID", "PATIENT_ID", "PROVIDER_NPI", "START_TIME", "END_TIME", "ENCOUNTER_TYPE"],
        EntityKind::Condition => &["ENC_ID", "PATIENT_ID", "ICD_CODE", "NAME"],
        EntityKind::Medication => &["ENC_ID", "PATIENT_ID", "RXNORM", "NAME"],
        EntityKind::Observation => &[
            "OBSERVATION_ID",
            "PATIENT_ID",
            "ENCOUNTER_ID",
            "DESCRIPTION",
            "VALUE",
            "UNIT",
            "CATEGORY",
            "CODE",
            "OBS_DATETIME",
        ],
    }
}

fn filter_clause(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Observation => " WHERE OBSERVATION_ID IS NOT NULL",
        _ => "",
    }
}

fn qualified_view(kind: EntityKind, database: &str, schema: &str) -> String {
    format!("{}.{}.{}", database, schema, kind.view_name())
}

pub fn select_sql(kind: EntityKind, database: &str, schema: &str, limit: usize) -> String {
    let order = match kind {
        EntityKind::Observation => " ORDER BY OBS_DATETIME",
        _ => "",
    };
    format!(
        "SELECT {} FROM {}{}{} LIMIT {}",
        columns(kind).join(", "),
        qualified_view(kind, database, schema),
        filter_clause(kind),
        order,
        limit
    )
}

pub fn count_sql(kind: EntityKind, database: &str, schema: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {}{}",
        qualified_view(kind, database, schema),
        filter_clause(kind)
    )
}
