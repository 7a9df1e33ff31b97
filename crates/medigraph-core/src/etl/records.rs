//! Mapping of warehouse rows onto graph nodes and edges.

use medigraph_common::{EntityKind, GraphEdge, GraphNode, NodeRef, RelationType, Row};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowError {
    #[error("missing value for column {column}")]
    MissingColumn { column: &'static str },

    #[error("column {column} is not a number: {value}")]
    InvalidNumber { column: &'static str, value: String },

    #[error("referenced node {reference} does not exist")]
    MissingReference { reference: NodeRef },
}

/// One row, transformed: the node it describes and the edges it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub node: GraphNode,
    pub edges: Vec<GraphEdge>,
}

impl EntityRecord {
    /// Endpoints other than the row's own node, without duplicates.
    pub fn referenced_nodes(&self) -> Vec<NodeRef> {
        let own = self.node.reference();
        let mut refs: Vec<NodeRef> = Vec::new();
        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if *end != own && !refs.contains(end) {
                    refs.push(end.clone());
                }
            }
        }
        refs
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn required_text(row: &Row, column: &'static str) -> Result<String, RowError> {
    text(row, column).ok_or(RowError::MissingColumn { column })
}

fn integer(row: &Row, column: &'static str) -> Result<Option<i64>, RowError> {
    match row.get(column) {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Some(i)),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Some(f as i64))
                .ok_or_else(|| RowError::InvalidNumber { column, value: n.to_string() }),
        },
        _ => match text(row, column) {
            None => Ok(None),
            Some(s) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|_| RowError::InvalidNumber { column, value: s }),
        },
    }
}

fn float(row: &Row, column: &'static str) -> Result<Option<f64>, RowError> {
    match row.get(column) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        _ => match text(row, column) {
            None => Ok(None),
            Some(s) => s
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Some)
                .ok_or(RowError::InvalidNumber { column, value: s }),
        },
    }
}

fn opt(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// Maps one row of `kind` to its node and edges.
///
/// Only parsing happens here; whether referenced nodes exist is checked by
/// the loader before anything is written.
pub fn transform(kind: EntityKind, row: &Row) -> Result<EntityRecord, RowError> {
    match kind {
        EntityKind::Patient => {
            let id = required_text(row, "PATIENT_ID")?;
            let first = text(row, "FIRST_NAME");
            let last = text(row, "LAST_NAME");
            let full_name = [first.as_deref(), last.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            let node = GraphNode::new(kind.as_str(), id)
                .with("first_name", opt(first))
                .with("last_name", opt(last))
                .with("full_name", opt((!full_name.is_empty()).then_some(full_name)))
                .with("sex", opt(text(row, "SEX")))
                .with("zip", opt(text(row, "ZIP")))
                .with("age", integer(row, "AGE")?.map(Value::from).unwrap_or(Value::Null));
            Ok(EntityRecord { node, edges: Vec::new() })
        }
        EntityKind::Provider => {
            let id = required_text(row, "PROVIDER_ID")?;
            let node = GraphNode::new(kind.as_str(), id)
                .with("name", opt(text(row, "PROVIDER_NAME")))
                .with("specialty", opt(text(row, "SPECIALTY")))
                .with("state", opt(text(row, "STATE")))
                .with("zip", opt(text(row, "ZIP")));
            Ok(EntityRecord { node, edges: Vec::new() })
        }
        EntityKind::Encounter => {
            let id = required_text(row, "ENC_ID")?;
            let patient = NodeRef::entity(EntityKind::Patient, required_text(row, "PATIENT_ID")?);
            let npi = text(row, "PROVIDER_NPI");
            let node = GraphNode::new(kind.as_str(), id)
                .with("start_time", opt(text(row, "START_TIME")))
                .with("end_time", opt(text(row, "END_TIME")))
                .with("provider_npi", opt(npi.clone()))
                .with("encounter_type", opt(text(row, "ENCOUNTER_TYPE")));
            let own = node.reference();

            let mut edges = vec![GraphEdge::new(patient.clone(), RelationType::HasEncounter, own.clone())];
            if let Some(npi) = npi {
                let provider = NodeRef::entity(EntityKind::Provider, npi);
                edges.push(GraphEdge::new(own, RelationType::HasProvider, provider.clone()));
                edges.push(GraphEdge::new(patient, RelationType::HasProvider, provider));
            }
            Ok(EntityRecord { node, edges })
        }
        EntityKind::Condition | EntityKind::Medication => {
            let (code_column, patient_rel, encounter_rel) = match kind {
                EntityKind::Condition => ("ICD_CODE", RelationType::HasCondition, RelationType::HasCondition),
                _ => ("RXNORM", RelationType::TakesMedication, RelationType::HasMedication),
            };
            let code = required_text(row, code_column)?;
            let patient = NodeRef::entity(EntityKind::Patient, required_text(row, "PATIENT_ID")?);
            let node = GraphNode::new(kind.as_str(), code).with("name", opt(text(row, "NAME")));
            let own = node.reference();

            let mut edges = vec![GraphEdge::new(patient, patient_rel, own.clone())];
            if let Some(enc) = text(row, "ENC_ID") {
                edges.push(GraphEdge::new(NodeRef::entity(EntityKind::Encounter, enc), encounter_rel, own));
            }
            Ok(EntityRecord { node, edges })
        }
        EntityKind::Observation => {
            let id = required_text(row, "OBSERVATION_ID")?;
            let patient = NodeRef::entity(EntityKind::Patient, required_text(row, "PATIENT_ID")?);
            let node = GraphNode::new(kind.as_str(), id)
                .with("description", opt(text(row, "DESCRIPTION")))
                .with("value", float(row, "VALUE")?.map(Value::from).unwrap_or(Value::Null))
                .with("unit", opt(text(row, "UNIT")))
                .with("category", opt(text(row, "CATEGORY")))
                .with("code", opt(text(row, "CODE")))
                .with("obs_datetime", opt(text(row, "OBS_DATETIME")));
            let own = node.reference();

            let mut edges = vec![GraphEdge::new(patient, RelationType::HasObservation, own.clone())];
            if let Some(enc) = text(row, "ENCOUNTER_ID") {
                edges.push(GraphEdge::new(NodeRef::entity(EntityKind::Encounter, enc), RelationType::HasObservation, own));
            }
            Ok(EntityRecord { node, edges })
        }
    }
}

/// Best-effort identifier for failure reports, before the row is parsed.
pub fn row_key(kind: EntityKind, row: &Row) -> String {
    let columns: &[&str] = match kind {
        EntityKind::Patient => &["PATIENT_ID"],
        EntityKind::Provider => &["PROVIDER_ID"],
        EntityKind::Encounter => &["ENC_ID"],
        EntityKind::Condition => &["PATIENT_ID", "ENC_ID", "ICD_CODE"],
        EntityKind::Medication => &["PATIENT_ID", "ENC_ID", "RXNORM"],
        EntityKind::Observation => &["OBSERVATION_ID"],
    };
    columns
        .iter()
        .map(|c| text(row, c).unwrap_or_else(|| "?".to_string()))
        .collect::<Vec<_>>()
        .join("/")
}
