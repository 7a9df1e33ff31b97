//! Node/edge writes and reads against the patient graph.

pub mod bolt;
pub mod memory;

pub use bolt::BoltGraph;
pub use memory::MemoryGraph;

use anyhow::Result;
use async_trait::async_trait;
use medigraph_common::{EdgeRow, GraphEdge, GraphNode, NodeRef, Properties, QueryResult};
use serde::{Deserialize, Serialize};
use crate::query::StructuredQuery;

/// Outcome of merging one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeWrite {
    Created,
    Existing,
    /// One of the endpoints does not exist; nothing was written.
    MissingEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCount {
    pub relationship_type: String,
    pub total: u64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name shown by status endpoints.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    /// Uniqueness constraints on node keys and lookup indexes. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    async fn count_nodes(&self, label: &str) -> Result<u64>;

    async fn node_exists(&self, node: &NodeRef) -> Result<bool>;

    /// Creates the node if its key is new, then sets its properties.
    /// Returns whether the node was created.
    async fn merge_node(&self, node: &GraphNode) -> Result<bool>;

    /// Merges the edge between two existing nodes. Never creates endpoints.
    async fn merge_edge(&self, edge: &GraphEdge) -> Result<EdgeWrite>;

    /// Totals per relationship type, largest first.
    async fn relationship_counts(&self) -> Result<Vec<RelationCount>>;

    async fn sample_edges(&self, limit: usize) -> Result<Vec<EdgeRow>>;

    /// Edges touching `node` in either direction, with `node` as the start.
    async fn neighbourhood(&self, node: &NodeRef, limit: usize) -> Result<Vec<EdgeRow>>;

    /// Nodes of `label` whose `property` contains `needle`, case-insensitively.
    async fn find_nodes(&self, label: &str, property: &str, needle: &str) -> Result<Vec<GraphNode>>;

    /// Runs a statement verbatim.
    async fn run_query(&self, cypher: &str, params: &Properties) -> Result<QueryResult>;

    async fn run_structured(&self, query: &StructuredQuery) -> Result<QueryResult> {
        self.run_query(query.cypher(), &query.params()).await
    }
}

/// Rejects anything but plain identifiers before they are spliced into a
/// statement. Labels and property names cannot be parameters.
pub(crate) fn check_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(anyhow::anyhow!("invalid graph identifier: {:?}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_identifier() {
        assert!(check_identifier("Patient").is_ok());
        assert!(check_identifier("full_name").is_ok());
        assert!(check_identifier("_x1").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("1abc").is_err());
        assert!(check_identifier("Patient) DETACH DELETE (n").is_err());
    }
}
