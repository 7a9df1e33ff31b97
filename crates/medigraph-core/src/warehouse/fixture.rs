use anyhow::{Result, anyhow};
use async_trait::async_trait;
use medigraph_common::{EntityKind, Row};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use super::{Warehouse, WarehouseInfo};

/// In-memory warehouse used by demo mode and tests.
#[derive(Debug, Clone, Default)]
pub struct FixtureWarehouse {
    rows: HashMap<EntityKind, Vec<Row>>,
    failing: HashSet<EntityKind>,
}

impl FixtureWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, kind: EntityKind, rows: Vec<Row>) -> Self {
        self.rows.entry(kind).or_default().extend(rows);
        self
    }

    pub fn insert(&mut self, kind: EntityKind, row: Row) {
        self.rows.entry(kind).or_default().push(row);
    }

    /// Every read of `kind` fails, as an unreachable view would.
    pub fn failing_on(mut self, kind: EntityKind) -> Self {
        self.failing.insert(kind);
        self
    }

    fn visible(&self, kind: EntityKind) -> Result<impl Iterator<Item = &Row>> {
        if self.failing.contains(&kind) {
            return Err(anyhow!("view {} is unavailable", kind.view_name()));
        }
        Ok(self
            .rows
            .get(&kind)
            .map(|rows| rows.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(move |row| match kind {
                EntityKind::Observation => row.get("OBSERVATION_ID").is_some_and(|v| !v.is_null()),
                _ => true,
            }))
    }

    /// Small synthetic data set: five patients with diabetes and
    /// hypertension facts, one provider and a handful of vitals.
    pub fn demo() -> Self {
        let patients = [
            ("P001", "Alice", "Nguyen", "F", "02115", 45),
            ("P002", "Brian", "Lopez", "M", "02120", 52),
            ("P003", "Chitra", "Patel", "F", "02119", 39),
            ("P004", "Diego", "Santos", "M", "02111", 61),
            ("P005", "Elena", "Kovac", "F", "02116", 33),
        ];
        let mut warehouse = Self::new();

        for (id, first, last, sex, zip, age) in patients {
            warehouse.insert(
                EntityKind::Patient,
                row(json!({
                    "PATIENT_ID": id, "FIRST_NAME": first, "LAST_NAME": last,
                    "SEX": sex, "ZIP": zip, "AGE": age.to_string()
                })),
            );
        }

        warehouse.insert(
            EntityKind::Provider,
            row(json!({
                "PROVIDER_ID": "NPI1001", "PROVIDER_NAME": "Dr. Maya Chen",
                "SPECIALTY": "Internal Medicine", "STATE": "MA", "ZIP": "02115"
            })),
        );
        warehouse.insert(
            EntityKind::Provider,
            row(json!({
                "PROVIDER_ID": "NPI1002", "PROVIDER_NAME": "Dr. Omar Haddad",
                "SPECIALTY": "Cardiology", "STATE": "MA", "ZIP": "02120"
            })),
        );

        let encounters = [
            ("E001", "P001", "NPI1001", "2024-01-08T09:00:00"),
            ("E002", "P002", "NPI1002", "2024-01-15T10:30:00"),
            ("E003", "P003", "NPI1001", "2024-02-02T14:00:00"),
            ("E004", "P004", "NPI1002", "2024-02-20T08:15:00"),
            ("E005", "P005", "NPI1001", "2024-03-11T11:45:00"),
        ];
        for (enc, patient, npi, start) in encounters {
            warehouse.insert(
                EntityKind::Encounter,
                row(json!({
                    "ENC_ID": enc, "PATIENT_ID": patient, "PROVIDER_NPI": npi,
                    "START_TIME": start, "END_TIME": start.replace("T", " "),
                    "ENCOUNTER_TYPE": "ambulatory"
                })),
            );
        }

        let conditions = [
            ("E001", "P001", "E11.9", "Type 2 diabetes mellitus"),
            ("E002", "P002", "I10", "Essential hypertension"),
            ("E003", "P003", "E11.9", "Type 2 diabetes mellitus"),
            ("E004", "P004", "I10", "Essential hypertension"),
            ("E004", "P004", "E11.9", "Type 2 diabetes mellitus"),
        ];
        for (enc, patient, code, name) in conditions {
            warehouse.insert(
                EntityKind::Condition,
                row(json!({ "ENC_ID": enc, "PATIENT_ID": patient, "ICD_CODE": code, "NAME": name })),
            );
        }

        let medications = [
            ("E001", "P001", "860975", "Metformin 500 MG Oral Tablet"),
            ("E002", "P002", "314076", "Lisinopril 10 MG Oral Tablet"),
            ("E003", "P003", "860975", "Metformin 500 MG Oral Tablet"),
            ("E004", "P004", "314076", "Lisinopril 10 MG Oral Tablet"),
            ("E004", "P004", "860975", "Metformin 500 MG Oral Tablet"),
        ];
        for (enc, patient, code, name) in medications {
            warehouse.insert(
                EntityKind::Medication,
                row(json!({ "ENC_ID": enc, "PATIENT_ID": patient, "RXNORM": code, "NAME": name })),
            );
        }

        let observations = [
            ("O001", "P001", "E001", "Hemoglobin A1c", "7.9", "%", "laboratory", "4548-4"),
            ("O002", "P002", "E002", "Systolic blood pressure", "148", "mm[Hg]", "vital-signs", "8480-6"),
            ("O003", "P003", "E003", "Hemoglobin A1c", "6.8", "%", "laboratory", "4548-4"),
            ("O004", "P004", "E004", "Systolic blood pressure", "152", "mm[Hg]", "vital-signs", "8480-6"),
            ("O005", "P005", "E005", "Body mass index", "24.1", "kg/m2", "vital-signs", "39156-5"),
        ];
        for (id, patient, enc, description, value, unit, category, code) in observations {
            warehouse.insert(
                EntityKind::Observation,
                row(json!({
                    "OBSERVATION_ID": id, "PATIENT_ID": patient, "ENCOUNTER_ID": enc,
                    "DESCRIPTION": description, "VALUE": value, "UNIT": unit,
                    "CATEGORY": category, "CODE": code, "OBS_DATETIME": "2024-01-08T09:30:00"
                })),
            );
        }

        warehouse
    }
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[async_trait]
impl Warehouse for FixtureWarehouse {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn ping(&self) -> Result<WarehouseInfo> {
        Ok(WarehouseInfo {
            account: Some("demo".into()),
            region: None,
            warehouse: None,
            database: Some("MEDIGRAPH".into()),
            schema: Some("PUBLIC".into()),
        })
    }

    async fn count_rows(&self, kind: EntityKind) -> Result<u64> {
        Ok(self.visible(kind)?.count() as u64)
    }

    async fn fetch_rows(&self, kind: EntityKind, limit: usize) -> Result<Vec<Row>> {
        Ok(self.visible(kind)?.take(limit).cloned().collect())
    }
}
