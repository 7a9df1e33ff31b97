use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod config;

/// A single warehouse row keyed by upper-case column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Node properties. Ordered so that generated statements are stable.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// The six tabular record kinds copied from the warehouse into the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Patient,
    Provider,
    Encounter,
    Condition,
    Medication,
    Observation,
}

impl EntityKind {
    /// Independent kinds first, then kinds that reference them.
    pub const LOAD_ORDER: [EntityKind; 6] = [
        EntityKind::Patient,
        EntityKind::Provider,
        EntityKind::Encounter,
        EntityKind::Condition,
        EntityKind::Medication,
        EntityKind::Observation,
    ];

    /// Graph label, also used as the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "Patient",
            EntityKind::Provider => "Provider",
            EntityKind::Encounter => "Encounter",
            EntityKind::Condition => "Condition",
            EntityKind::Medication => "Medication",
            EntityKind::Observation => "Observation",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Provider => "providers",
            EntityKind::Encounter => "encounters",
            EntityKind::Condition => "conditions",
            EntityKind::Medication => "medications",
            EntityKind::Observation => "observations",
        }
    }

    /// Warehouse view (or table) the rows are read from.
    pub fn view_name(&self) -> &'static str {
        match self {
            EntityKind::Patient => "V_PATIENTS",
            EntityKind::Provider => "V_PROVIDERS",
            EntityKind::Encounter => "V_ENCOUNTERS",
            EntityKind::Condition => "V_CONDITIONS",
            EntityKind::Medication => "V_MEDICATIONS",
            EntityKind::Observation => "OBSERVATIONS",
        }
    }

    pub fn key_property(&self) -> &'static str {
        key_property(self.as_str())
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::LOAD_ORDER
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(label) || k.plural().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s.trim()).ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

pub const GUIDELINE_LABEL: &str = "Guideline";

/// Property that identifies a node of the given label.
///
/// Conditions and medications are concept nodes keyed by their code; every
/// other label is keyed by `id`.
pub fn key_property(label: &str) -> &'static str {
    match label {
        "Condition" | "Medication" => "code",
        _ => "id",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationType {
    HasCondition,
    TakesMedication,
    HasEncounter,
    HasProvider,
    HasObservation,
    HasMedication,
    MentionsCondition,
    MentionsMedication,
    Recommends,
    TargetsCondition,
    ContraindicatedFor,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::HasCondition => "HAS_CONDITION",
            RelationType::TakesMedication => "TAKES_MEDICATION",
            RelationType::HasEncounter => "HAS_ENCOUNTER",
            RelationType::HasProvider => "HAS_PROVIDER",
            RelationType::HasObservation => "HAS_OBSERVATION",
            RelationType::HasMedication => "HAS_MEDICATION",
            RelationType::MentionsCondition => "MENTIONS_CONDITION",
            RelationType::MentionsMedication => "MENTIONS_MEDICATION",
            RelationType::Recommends => "RECOMMENDS",
            RelationType::TargetsCondition => "TARGETS_CONDITION",
            RelationType::ContraindicatedFor => "CONTRAINDICATED_FOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HAS_CONDITION" => Some(RelationType::HasCondition),
            "TAKES_MEDICATION" => Some(RelationType::TakesMedication),
            "HAS_ENCOUNTER" => Some(RelationType::HasEncounter),
            "HAS_PROVIDER" => Some(RelationType::HasProvider),
            "HAS_OBSERVATION" => Some(RelationType::HasObservation),
            "HAS_MEDICATION" => Some(RelationType::HasMedication),
            "MENTIONS_CONDITION" => Some(RelationType::MentionsCondition),
            "MENTIONS_MEDICATION" => Some(RelationType::MentionsMedication),
            "RECOMMENDS" => Some(RelationType::Recommends),
            "TARGETS_CONDITION" => Some(RelationType::TargetsCondition),
            "CONTRAINDICATED_FOR" => Some(RelationType::ContraindicatedFor),
            _ => None,
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a node: its label plus the value of its key property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub label: String,
    pub key: String,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self { label: label.into(), key: key.into() }
    }

    pub fn entity(kind: EntityKind, key: impl Into<String>) -> Self {
        Self::new(kind.as_str(), key)
    }

    pub fn key_property(&self) -> &'static str {
        key_property(&self.label)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label, self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub label: String,
    pub key: String,
    pub properties: Properties,
}

impl GraphNode {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
            properties: Properties::new(),
        }
    }

    /// Sets a property, dropping JSON nulls so they never overwrite stored values.
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.properties.insert(name.to_string(), value);
        }
        self
    }

    pub fn reference(&self) -> NodeRef {
        NodeRef::new(self.label.clone(), self.key.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub source: NodeRef,
    pub relation: RelationType,
    pub target: NodeRef,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphEdge {
    pub fn new(source: NodeRef, relation: RelationType, target: NodeRef) -> Self {
        Self {
            source,
            relation,
            target,
            properties: Properties::new(),
        }
    }
}

/// A flattened edge as shown in dashboard tables and fed to the graph view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRow {
    pub start_id: String,
    pub start_label: String,
    pub relationship_type: String,
    pub end_id: String,
    pub end_label: String,
}

/// Tabular result of a graph query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Looks up a cell by column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_order_puts_references_first() {
        let pos = |k: EntityKind| EntityKind::LOAD_ORDER.iter().position(|x| *x == k).unwrap();
        assert!(pos(EntityKind::Patient) < pos(EntityKind::Encounter));
        assert!(pos(EntityKind::Provider) < pos(EntityKind::Encounter));
        assert!(pos(EntityKind::Encounter) < pos(EntityKind::Observation));
        assert!(pos(EntityKind::Encounter) < pos(EntityKind::Condition));
        assert!(pos(EntityKind::Encounter) < pos(EntityKind::Medication));
    }

    #[test]
    fn test_entity_kind_parsing() {
        assert_eq!("patient".parse::<EntityKind>().unwrap(), EntityKind::Patient);
        assert_eq!("Observations".parse::<EntityKind>().unwrap(), EntityKind::Observation);
        assert!("guideline".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_key_property() {
        assert_eq!(EntityKind::Condition.key_property(), "code");
        assert_eq!(EntityKind::Medication.key_property(), "code");
        assert_eq!(EntityKind::Patient.key_property(), "id");
        assert_eq!(key_property(GUIDELINE_LABEL), "id");
    }

    #[test]
    fn test_relation_round_trip_names() {
        for rel in [RelationType::HasCondition, RelationType::TakesMedication, RelationType::ContraindicatedFor] {
            assert_eq!(RelationType::from_str(rel.as_str()), Some(rel));
        }
        assert_eq!(RelationType::from_str("SEEN_BY"), None);
    }

    #[test]
    fn test_node_builder_drops_nulls() {
        let node = GraphNode::new("Patient", "P001")
            .with("sex", "F")
            .with("zip", serde_json::Value::Null);
        assert_eq!(node.properties.len(), 1);
        assert_eq!(node.reference(), NodeRef::entity(EntityKind::Patient, "P001"));
    }

    #[test]
    fn test_query_result_lookup() {
        let result = QueryResult {
            columns: vec!["patient_id".into(), "age".into()],
            rows: vec![vec![serde_json::json!("P001"), serde_json::json!(45)]],
        };
        assert_eq!(result.get(0, "age"), Some(&serde_json::json!(45)));
        assert_eq!(result.get(0, "missing"), None);
        assert_eq!(result.get(1, "age"), None);
    }
}
