use anyhow::{Result, anyhow};
use async_trait::async_trait;
use medigraph_common::{
    EdgeRow, EntityKind, GraphEdge, GraphNode, NodeRef, Properties, QueryResult, RelationType,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use super::{EdgeWrite, GraphStore, RelationCount};
use crate::query::StructuredQuery;

type EdgeKey = (NodeRef, RelationType, NodeRef);

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<NodeRef, Properties>,
    edges: BTreeMap<EdgeKey, Properties>,
}

/// In-process graph for demo mode and tests.
///
/// Keeps the same merge-by-identity rules as the Bolt backend. Free-form
/// Cypher is not interpreted; structured queries are evaluated natively.
#[derive(Clone, Default)]
pub struct MemoryGraph {
    inner: Arc<RwLock<Inner>>,
}

fn prop(properties: &Properties, name: &str) -> Value {
    properties.get(name).cloned().unwrap_or(Value::Null)
}

fn text_contains(properties: &Properties, name: &str, needle: &str) -> bool {
    match properties.get(name) {
        Some(Value::String(s)) => s.to_lowercase().contains(needle),
        Some(Value::Null) | None => false,
        Some(other) => other.to_string().to_lowercase().contains(needle),
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_total(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn edge_total(&self) -> usize {
        self.inner.read().await.edges.len()
    }

    pub async fn node(&self, node: &NodeRef) -> Option<Properties> {
        self.inner.read().await.nodes.get(node).cloned()
    }

    pub async fn has_edge(&self, source: &NodeRef, relation: RelationType, target: &NodeRef) -> bool {
        self.inner
            .read()
            .await
            .edges
            .contains_key(&(source.clone(), relation, target.clone()))
    }

    fn edge_row(start: &NodeRef, relation: RelationType, end: &NodeRef) -> EdgeRow {
        EdgeRow {
            start_id: start.key.clone(),
            start_label: start.label.clone(),
            relationship_type: relation.as_str().to_string(),
            end_id: end.key.clone(),
            end_label: end.label.clone(),
        }
    }

    fn neighbours(inner: &Inner, node: &NodeRef, limit: usize) -> Vec<EdgeRow> {
        inner
            .edges
            .keys()
            .filter_map(|(source, relation, target)| {
                if source == node {
                    Some(Self::edge_row(node, *relation, target))
                } else if target == node {
                    Some(Self::edge_row(node, *relation, source))
                } else {
                    None
                }
            })
            .take(limit)
            .collect()
    }

    fn evaluate(inner: &Inner, query: &StructuredQuery) -> Vec<Vec<Value>> {
        let empty = Properties::new();
        let props = |node: &NodeRef| inner.nodes.get(node).unwrap_or(&empty);
        let patient = EntityKind::Patient.as_str();

        match query {
            StructuredQuery::PatientsWithCondition { term } => {
                let needle = term.trim().to_lowercase();
                inner
                    .edges
                    .keys()
                    .filter(|(p, rel, c)| {
                        *rel == RelationType::HasCondition
                            && p.label == patient
                            && c.label == EntityKind::Condition.as_str()
                            && text_contains(props(c), "name", &needle)
                    })
                    .map(|(p, _, c)| {
                        let pp = props(p);
                        vec![
                            Value::String(p.key.clone()),
                            prop(pp, "full_name"),
                            prop(pp, "sex"),
                            prop(pp, "age"),
                            prop(props(c), "name"),
                        ]
                    })
                    .take(query.limit())
                    .collect()
            }
            StructuredQuery::MedicationsForCondition { term } => {
                let needle = term.trim().to_lowercase();
                let matching: BTreeSet<&NodeRef> = inner
                    .edges
                    .keys()
                    .filter(|(p, rel, c)| {
                        *rel == RelationType::HasCondition
                            && p.label == patient
                            && c.label == EntityKind::Condition.as_str()
                            && text_contains(props(c), "name", &needle)
                    })
                    .map(|(p, _, _)| p)
                    .collect();

                let mut users: HashMap<&NodeRef, BTreeSet<&NodeRef>> = HashMap::new();
                for (p, rel, m) in inner.edges.keys() {
                    if *rel == RelationType::TakesMedication
                        && m.label == EntityKind::Medication.as_str()
                        && matching.contains(p)
                    {
                        users.entry(m).or_default().insert(p);
                    }
                }

                let mut rows: Vec<(&NodeRef, usize)> = users.into_iter().map(|(m, ps)| (m, ps.len())).collect();
                rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.key.cmp(&b.0.key)));
                rows.into_iter()
                    .take(query.limit())
                    .map(|(m, count)| vec![Value::String(m.key.clone()), prop(props(m), "name"), Value::from(count)])
                    .collect()
            }
            StructuredQuery::MedicationsForPatient { patient_id } => {
                let source = NodeRef::entity(EntityKind::Patient, patient_id.trim());
                inner
                    .edges
                    .keys()
                    .filter(|(p, rel, m)| {
                        *p == source && *rel == RelationType::TakesMedication && m.label == EntityKind::Medication.as_str()
                    })
                    .map(|(p, _, m)| {
                        vec![
                            Value::String(p.key.clone()),
                            prop(props(p), "full_name"),
                            Value::String(m.key.clone()),
                            prop(props(m), "name"),
                        ]
                    })
                    .take(query.limit())
                    .collect()
            }
            StructuredQuery::PatientJourney { patient_id, limit } => {
                let node = NodeRef::entity(EntityKind::Patient, patient_id.trim());
                Self::neighbours(inner, &node, *limit)
                    .into_iter()
                    .map(|e| {
                        vec![
                            Value::String(e.start_id),
                            Value::String(e.relationship_type),
                            Value::String(e.end_label),
                            Value::String(e.end_id),
                        ]
                    })
                    .collect()
            }
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn count_nodes(&self, label: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.nodes.keys().filter(|n| n.label == label).count() as u64)
    }

    async fn node_exists(&self, node: &NodeRef) -> Result<bool> {
        Ok(self.inner.read().await.nodes.contains_key(node))
    }

    async fn merge_node(&self, node: &GraphNode) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let reference = node.reference();
        let created = !inner.nodes.contains_key(&reference);
        let entry = inner.nodes.entry(reference).or_default();
        entry.insert(node.reference().key_property().to_string(), Value::String(node.key.clone()));
        entry.extend(node.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(created)
    }

    async fn merge_edge(&self, edge: &GraphEdge) -> Result<EdgeWrite> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&edge.source) || !inner.nodes.contains_key(&edge.target) {
            return Ok(EdgeWrite::MissingEndpoint);
        }
        let key = (edge.source.clone(), edge.relation, edge.target.clone());
        let outcome = if inner.edges.contains_key(&key) {
            EdgeWrite::Existing
        } else {
            EdgeWrite::Created
        };
        inner
            .edges
            .entry(key)
            .or_default()
            .extend(edge.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(outcome)
    }

    async fn relationship_counts(&self) -> Result<Vec<RelationCount>> {
        let inner = self.inner.read().await;
        let mut totals: BTreeMap<&'static str, u64> = BTreeMap::new();
        for (_, relation, _) in inner.edges.keys() {
            *totals.entry(relation.as_str()).or_default() += 1;
        }
        let mut counts: Vec<RelationCount> = totals
            .into_iter()
            .map(|(name, total)| RelationCount { relationship_type: name.to_string(), total })
            .collect();
        counts.sort_by(|a, b| b.total.cmp(&a.total));
        Ok(counts)
    }

    async fn sample_edges(&self, limit: usize) -> Result<Vec<EdgeRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .edges
            .keys()
            .take(limit)
            .map(|(s, r, t)| Self::edge_row(s, *r, t))
            .collect())
    }

    async fn neighbourhood(&self, node: &NodeRef, limit: usize) -> Result<Vec<EdgeRow>> {
        Ok(Self::neighbours(&*self.inner.read().await, node, limit))
    }

    async fn find_nodes(&self, label: &str, property: &str, needle: &str) -> Result<Vec<GraphNode>> {
        let needle = needle.to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .iter()
            .filter(|(r, p)| r.label == label && text_contains(p, property, &needle))
            .map(|(r, p)| GraphNode { label: r.label.clone(), key: r.key.clone(), properties: p.clone() })
            .collect())
    }

    async fn run_query(&self, _cypher: &str, _params: &Properties) -> Result<QueryResult> {
        Err(anyhow!("the in-memory graph does not execute Cypher; connect Neo4j or use a structured query"))
    }

    async fn run_structured(&self, query: &StructuredQuery) -> Result<QueryResult> {
        let inner = self.inner.read().await;
        Ok(QueryResult {
            columns: query.columns().iter().map(|c| c.to_string()).collect(),
            rows: Self::evaluate(&inner, query),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryGraph {
        let graph = MemoryGraph::new();
        for (id, name) in [("P001", "Alice Nguyen"), ("P002", "Brian Lopez")] {
            graph
                .merge_node(&GraphNode::new("Patient", id).with("full_name", name).with("age", 40))
                .await
                .unwrap();
        }
        graph.merge_node(&GraphNode::new("Condition", "E11.9").with("name", "Type 2 diabetes mellitus")).await.unwrap();
        graph.merge_node(&GraphNode::new("Condition", "I10").with("name", "Essential hypertension")).await.unwrap();
        graph.merge_node(&GraphNode::new("Medication", "860975").with("name", "Metformin")).await.unwrap();
        graph.merge_node(&GraphNode::new("Medication", "314076").with("name", "Lisinopril")).await.unwrap();

        let p1 = NodeRef::new("Patient", "P001");
        let p2 = NodeRef::new("Patient", "P002");
        let dm = NodeRef::new("Condition", "E11.9");
        let htn = NodeRef::new("Condition", "I10");
        let met = NodeRef::new("Medication", "860975");
        let lis = NodeRef::new("Medication", "314076");
        for edge in [
            GraphEdge::new(p1.clone(), RelationType::HasCondition, dm.clone()),
            GraphEdge::new(p2.clone(), RelationType::HasCondition, dm),
            GraphEdge::new(p2.clone(), RelationType::HasCondition, htn),
            GraphEdge::new(p1.clone(), RelationType::TakesMedication, met.clone()),
            GraphEdge::new(p2.clone(), RelationType::TakesMedication, met),
            GraphEdge::new(p2, RelationType::TakesMedication, lis),
        ] {
            assert_eq!(graph.merge_edge(&edge).await.unwrap(), EdgeWrite::Created);
        }
        graph
    }

    #[tokio::test]
    async fn test_merge_node_is_idempotent() {
        let graph = MemoryGraph::new();
        let node = GraphNode::new("Patient", "P001").with("sex", "F");
        assert!(graph.merge_node(&node).await.unwrap());
        assert!(!graph.merge_node(&node.clone().with("zip", "02115")).await.unwrap());
        assert_eq!(graph.count_nodes("Patient").await.unwrap(), 1);

        let stored = graph.node(&NodeRef::new("Patient", "P001")).await.unwrap();
        assert_eq!(stored["id"], json!("P001"));
        assert_eq!(stored["zip"], json!("02115"));
    }

    #[tokio::test]
    async fn test_merge_edge_never_creates_endpoints() {
        let graph = MemoryGraph::new();
        graph.merge_node(&GraphNode::new("Patient", "P001")).await.unwrap();
        let edge = GraphEdge::new(
            NodeRef::new("Patient", "P001"),
            RelationType::HasEncounter,
            NodeRef::new("Encounter", "E404"),
        );
        assert_eq!(graph.merge_edge(&edge).await.unwrap(), EdgeWrite::MissingEndpoint);
        assert_eq!(graph.node_total().await, 1);
        assert_eq!(graph.edge_total().await, 0);
    }

    #[tokio::test]
    async fn test_merge_edge_twice() {
        let graph = seeded().await;
        let edge = GraphEdge::new(
            NodeRef::new("Patient", "P001"),
            RelationType::HasCondition,
            NodeRef::new("Condition", "E11.9"),
        );
        assert_eq!(graph.merge_edge(&edge).await.unwrap(), EdgeWrite::Existing);
        assert_eq!(graph.edge_total().await, 6);
    }

    #[tokio::test]
    async fn test_relationship_counts_sorted() {
        let counts = seeded().await.relationship_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].total, 3);
        assert_eq!(counts.iter().map(|c| c.total).sum::<u64>(), 6);
    }

    #[tokio::test]
    async fn test_patients_with_condition() {
        let graph = seeded().await;
        let result = graph
            .run_structured(&StructuredQuery::PatientsWithCondition { term: "DIABETES".into() })
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["patient_id", "full_name", "sex", "age", "condition"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.get(0, "patient_id"), Some(&json!("P001")));
        assert_eq!(result.get(0, "sex"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_medications_for_condition_counts_patients() {
        let graph = seeded().await;
        let result = graph
            .run_structured(&StructuredQuery::MedicationsForCondition { term: "diabetes".into() })
            .await
            .unwrap();
        assert_eq!(result.rows[0], vec![json!("860975"), json!("Metformin"), json!(2)]);
        assert_eq!(result.rows[1], vec![json!("314076"), json!("Lisinopril"), json!(1)]);

        let result = graph
            .run_structured(&StructuredQuery::MedicationsForCondition { term: "hypertension".into() })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.rows.iter().all(|r| r[2] == json!(1)));
    }

    #[tokio::test]
    async fn test_patient_journey_and_neighbourhood() {
        let graph = seeded().await;
        let result = graph
            .run_structured(&StructuredQuery::PatientJourney { patient_id: "P002".into(), limit: 10 })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 4);

        let edges = graph.neighbourhood(&NodeRef::new("Condition", "E11.9"), 10).await.unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.start_id == "E11.9" && e.end_label == "Patient"));
    }

    #[tokio::test]
    async fn test_find_nodes_case_insensitive() {
        let graph = seeded().await;
        let found = graph.find_nodes("Condition", "name", "HYPERTENSION").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "I10");
    }

    #[tokio::test]
    async fn test_run_query_is_unsupported() {
        let graph = MemoryGraph::new();
        assert!(graph.run_query("MATCH (n) RETURN n", &Properties::new()).await.is_err());
    }
}
