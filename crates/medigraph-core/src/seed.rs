//! Built-in clinical guideline snippets and their links into the patient graph.

use anyhow::Result;
use medigraph_common::{
    EntityKind, GraphEdge, GraphNode, NodeRef, RelationType, GUIDELINE_LABEL,
};
use serde::{Deserialize, Serialize};
use crate::graph::{EdgeWrite, GraphStore};

pub struct Guideline {
    pub id: &'static str,
    pub title: &'static str,
    pub source: &'static str,
    pub text: &'static str,
}

pub const GUIDELINES: &[Guideline] = &[
    Guideline {
        id: "GL_DM_001",
        title: "Type 2 Diabetes - First-line Therapy",
        source: "SynthCare 2025 guideline",
        text: "For adults with type 2 diabetes, start metformin as first-line therapy \
               unless contraindicated. For patients with hypertension, consider an ACE \
               inhibitor such as lisinopril. Avoid NSAIDs in patients with advanced \
               chronic kidney disease.",
    },
    Guideline {
        id: "GL_HTN_001",
        title: "Hypertension - Blood Pressure Targets",
        source: "SynthCare 2025 guideline",
        text: "In adults with hypertension, target blood pressure below 130/80 mmHg. \
               For patients with diabetes and hypertension, ACE inhibitors such as \
               lisinopril or ARBs are recommended. Beta blockers are not first-line \
               for uncomplicated hypertension.",
    },
];

/// Condition name fragment, and the phrases that count as a mention of it.
pub const CONDITION_KEYWORDS: &[(&str, &[&str])] = &[
    ("diabetes", &["diabetes", "type 2 diabetes"]),
    ("hypertension", &["hypertension", "high blood pressure"]),
    ("chronic kidney disease", &["chronic kidney disease", "ckd"]),
];

pub const MEDICATION_KEYWORDS: &[(&str, &[&str])] = &[
    ("metformin", &["metformin"]),
    ("lisinopril", &["lisinopril"]),
    ("beta-blocker", &["beta blocker", "beta-blocker"]),
    ("nsaid", &["nsaid", "nsaids"]),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub guidelines: usize,
    pub nodes_created: u64,
    pub edges_created: u64,
    pub edges_existing: u64,
}

impl SeedReport {
    fn record(&mut self, outcome: EdgeWrite) {
        match outcome {
            EdgeWrite::Created => self.edges_created += 1,
            EdgeWrite::Existing => self.edges_existing += 1,
            EdgeWrite::MissingEndpoint => {}
        }
    }
}

fn mentions(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

/// Writes the guideline nodes, then links each to the Condition and
/// Medication nodes its text mentions. Safe to run repeatedly.
pub async fn seed_guidelines(graph: &dyn GraphStore) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    for guideline in GUIDELINES {
        let node = GraphNode::new(GUIDELINE_LABEL, guideline.id)
            .with("title", guideline.title)
            .with("source", guideline.source)
            .with("text", guideline.text);
        if graph.merge_node(&node).await? {
            report.nodes_created += 1;
        }
        report.guidelines += 1;
    }
    tracing::info!("Created/updated {} guideline nodes", report.guidelines);

    for guideline in GUIDELINES {
        let gl = NodeRef::new(GUIDELINE_LABEL, guideline.id);
        let text = guideline.text.to_lowercase();

        for (name, phrases) in CONDITION_KEYWORDS {
            if mentions(&text, phrases) {
                for c in graph.find_nodes(EntityKind::Condition.as_str(), "name", name).await? {
                    let edge = GraphEdge::new(gl.clone(), RelationType::MentionsCondition, c.reference());
                    report.record(graph.merge_edge(&edge).await?);
                }
            }
        }

        for (name, phrases) in MEDICATION_KEYWORDS {
            if mentions(&text, phrases) {
                for m in graph.find_nodes(EntityKind::Medication.as_str(), "name", name).await? {
                    let edge = GraphEdge::new(gl.clone(), RelationType::MentionsMedication, m.reference());
                    report.record(graph.merge_edge(&edge).await?);
                }
            }
        }

        if text.contains("metformin") && text.contains("type 2 diabetes") {
            let conditions = graph.find_nodes(EntityKind::Condition.as_str(), "name", "diabetes").await?;
            let medications = graph.find_nodes(EntityKind::Medication.as_str(), "name", "metformin").await?;
            // Both sides must exist before either edge is drawn.
            if !conditions.is_empty() && !medications.is_empty() {
                for m in &medications {
                    let mut edge = GraphEdge::new(gl.clone(), RelationType::Recommends, m.reference());
                    edge.properties.insert("reason".into(), "first-line therapy".into());
                    report.record(graph.merge_edge(&edge).await?);
                }
                for c in &conditions {
                    let edge = GraphEdge::new(gl.clone(), RelationType::TargetsCondition, c.reference());
                    report.record(graph.merge_edge(&edge).await?);
                }
            }
        }

        if text.contains("avoid nsaids") && text.contains("chronic kidney disease") {
            for c in graph
                .find_nodes(EntityKind::Condition.as_str(), "name", "chronic kidney disease")
                .await?
            {
                let edge = GraphEdge::new(gl.clone(), RelationType::ContraindicatedFor, c.reference());
                report.record(graph.merge_edge(&edge).await?);
            }
        }
    }

    tracing::info!(
        "Linked guidelines: {} edges created, {} already present",
        report.edges_created,
        report.edges_existing
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    async fn graph_with_concepts() -> MemoryGraph {
        let graph = MemoryGraph::new();
        for (label, code, name) in [
            ("Condition", "E11.9", "Type 2 diabetes mellitus"),
            ("Condition", "I10", "Essential hypertension"),
            ("Condition", "N18.4", "Chronic kidney disease stage 4"),
            ("Medication", "860975", "Metformin 500 MG Oral Tablet"),
            ("Medication", "314076", "Lisinopril 10 MG Oral Tablet"),
        ] {
            graph.merge_node(&GraphNode::new(label, code).with("name", name)).await.unwrap();
        }
        graph
    }

    #[tokio::test]
    async fn test_seed_links_guidelines() -> Result<()> {
        let graph = graph_with_concepts().await;
        let report = seed_guidelines(&graph).await?;
        assert_eq!(report.guidelines, 2);
        assert_eq!(report.nodes_created, 2);

        let dm = NodeRef::new(GUIDELINE_LABEL, "GL_DM_001");
        let htn = NodeRef::new(GUIDELINE_LABEL, "GL_HTN_001");
        let metformin = NodeRef::new("Medication", "860975");
        let ckd = NodeRef::new("Condition", "N18.4");

        assert!(graph.has_edge(&dm, RelationType::Recommends, &metformin).await);
        assert!(graph.has_edge(&dm, RelationType::TargetsCondition, &NodeRef::new("Condition", "E11.9")).await);
        assert!(graph.has_edge(&dm, RelationType::ContraindicatedFor, &ckd).await);
        assert!(graph.has_edge(&dm, RelationType::MentionsCondition, &ckd).await);
        assert!(graph.has_edge(&htn, RelationType::MentionsMedication, &NodeRef::new("Medication", "314076")).await);
        assert!(!graph.has_edge(&htn, RelationType::Recommends, &metformin).await);
        assert!(!graph.has_edge(&htn, RelationType::MentionsMedication, &metformin).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() -> Result<()> {
        let graph = graph_with_concepts().await;
        let first = seed_guidelines(&graph).await?;
        let edges = graph.edge_total().await;

        let second = seed_guidelines(&graph).await?;
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.edges_created, 0);
        assert_eq!(second.edges_existing, first.edges_created);
        assert_eq!(graph.edge_total().await, edges);
        Ok(())
    }

    #[tokio::test]
    async fn test_seed_on_empty_graph_writes_only_guidelines() -> Result<()> {
        let graph = MemoryGraph::new();
        let report = seed_guidelines(&graph).await?;
        assert_eq!(report.edges_created, 0);
        assert_eq!(graph.count_nodes(GUIDELINE_LABEL).await?, 2);
        Ok(())
    }
}
