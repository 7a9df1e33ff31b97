//! Question answering over the graph.
//!
//! Free text goes through the generation API when one is configured and
//! through the phrase router otherwise. Either way the caller always gets a
//! [`QueryAnswer`]; failures turn into [`FALLBACK_MESSAGE`].

pub mod cypher;
pub mod structured;

pub use cypher::CypherGenerator;
pub use structured::{route_question, StructuredQuery, HELP_TEXT};

use medigraph_common::{Properties, QueryResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use crate::graph::GraphStore;
use crate::llm::LLMClient;

pub const FALLBACK_MESSAGE: &str =
    "Sorry, I couldn't answer that question from the graph. Try rephrasing it or use one of the structured queries.";

const NO_ROWS_MESSAGE: &str = "The query ran but returned no rows.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    /// Cypher written by the generation API.
    Generated,
    /// Phrase router, used without a generation API key.
    Router,
    Structured,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnswer {
    pub question: String,
    pub source: AnswerSource,
    /// The statement that was run, when there was one.
    pub cypher: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub message: Option<String>,
    pub fallback: bool,
}

impl QueryAnswer {
    fn from_result(question: &str, source: AnswerSource, cypher: Option<String>, result: QueryResult) -> Self {
        Self {
            question: question.to_string(),
            source,
            cypher,
            columns: result.columns,
            rows: result.rows,
            message: None,
            fallback: false,
        }
    }

    fn failed(question: &str, source: AnswerSource, cypher: Option<String>) -> Self {
        Self {
            question: question.to_string(),
            source,
            cypher,
            columns: Vec::new(),
            rows: Vec::new(),
            message: Some(FALLBACK_MESSAGE.to_string()),
            fallback: true,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone)]
pub struct QueryService {
    graph: Arc<dyn GraphStore>,
    generator: Option<CypherGenerator>,
}

impl QueryService {
    pub fn new(graph: Arc<dyn GraphStore>, llm: Option<Arc<dyn LLMClient>>) -> Self {
        Self {
            graph,
            generator: llm.map(CypherGenerator::new),
        }
    }

    pub fn generation_model(&self) -> Option<&str> {
        self.generator.as_ref().map(|g| g.model())
    }

    pub async fn ask(&self, question: &str) -> QueryAnswer {
        let question = question.trim();
        match &self.generator {
            Some(generator) => self.ask_generated(generator, question).await,
            None => self.ask_routed(question).await,
        }
    }

    async fn ask_generated(&self, generator: &CypherGenerator, question: &str) -> QueryAnswer {
        let cypher = match generator.generate(question).await {
            Ok(cypher) => cypher,
            Err(e) => {
                tracing::warn!("Cypher generation failed for {:?}: {:?}", question, e);
                return QueryAnswer::failed(question, AnswerSource::Generated, None);
            }
        };

        match self.graph.run_query(&cypher, &Properties::new()).await {
            Ok(result) => {
                let empty = result.is_empty();
                let answer = QueryAnswer::from_result(question, AnswerSource::Generated, Some(cypher), result);
                if empty {
                    answer.with_message(NO_ROWS_MESSAGE)
                } else {
                    answer
                }
            }
            Err(e) => {
                tracing::warn!("Generated Cypher failed: {} ({:?})", cypher, e);
                QueryAnswer::failed(question, AnswerSource::Generated, Some(cypher))
            }
        }
    }

    async fn ask_routed(&self, question: &str) -> QueryAnswer {
        match route_question(question) {
            Some(query) => {
                let mut answer = self.run_structured(&query).await;
                answer.question = question.to_string();
                answer.source = AnswerSource::Router;
                answer
            }
            None => QueryAnswer::from_result(question, AnswerSource::Router, None, QueryResult::default())
                .with_message(HELP_TEXT),
        }
    }

    pub async fn run_structured(&self, query: &StructuredQuery) -> QueryAnswer {
        let label = query.title();
        match self.graph.run_structured(query).await {
            Ok(result) => {
                let message = if result.is_empty() { query.empty_message() } else { label.clone() };
                QueryAnswer::from_result(&label, AnswerSource::Structured, Some(query.cypher().to_string()), result)
                    .with_message(message)
            }
            Err(e) => {
                tracing::warn!("Structured query {:?} failed: {:?}", query, e);
                QueryAnswer::failed(&label, AnswerSource::Structured, Some(query.cypher().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeWrite, MemoryGraph, RelationCount};
    use crate::llm::LLMResponse;
    use medigraph_common::config::LLMProvider;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use medigraph_common::{EdgeRow, GraphEdge, GraphNode, NodeRef, RelationType};
    use serde_json::json;
    use std::sync::Mutex;

    struct MockLLM {
        reply: Option<String>,
    }

    #[async_trait]
    impl LLMClient for MockLLM {
        fn provider(&self) -> LLMProvider {
            LLMProvider::OpenAI
        }

        fn model(&self) -> &str {
            "mock"
        }

        async fn chat(&self, _system_prompt: &str, _user_prompt: &str) -> Result<LLMResponse<String>> {
            match &self.reply {
                Some(text) => Ok(LLMResponse { data: text.clone(), usage: Default::default() }),
                None => Err(anyhow!("rate limited")),
            }
        }
    }

    /// Answers every statement with the same table and records what it ran.
    struct CannedGraph {
        result: Result<QueryResult, String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GraphStore for CannedGraph {
        fn name(&self) -> &'static str { "canned" }
        async fn ping(&self) -> Result<()> { Ok(()) }
        async fn ensure_schema(&self) -> Result<()> { Ok(()) }
        async fn count_nodes(&self, _label: &str) -> Result<u64> { Ok(0) }
        async fn node_exists(&self, _node: &NodeRef) -> Result<bool> { Ok(false) }
        async fn merge_node(&self, _node: &GraphNode) -> Result<bool> { Ok(false) }
        async fn merge_edge(&self, _edge: &GraphEdge) -> Result<EdgeWrite> { Ok(EdgeWrite::MissingEndpoint) }
        async fn relationship_counts(&self) -> Result<Vec<RelationCount>> { Ok(Vec::new()) }
        async fn sample_edges(&self, _limit: usize) -> Result<Vec<EdgeRow>> { Ok(Vec::new()) }
        async fn neighbourhood(&self, _node: &NodeRef, _limit: usize) -> Result<Vec<EdgeRow>> { Ok(Vec::new()) }
        async fn find_nodes(&self, _l: &str, _p: &str, _n: &str) -> Result<Vec<GraphNode>> { Ok(Vec::new()) }

        async fn run_query(&self, cypher: &str, _params: &Properties) -> Result<QueryResult> {
            self.seen.lock().unwrap().push(cypher.to_string());
            self.result.clone().map_err(|e| anyhow!(e))
        }
    }

    fn canned(result: Result<QueryResult, String>) -> Arc<CannedGraph> {
        Arc::new(CannedGraph { result, seen: Mutex::new(Vec::new()) })
    }

    fn llm(reply: Option<&str>) -> Option<Arc<dyn LLMClient>> {
        Some(Arc::new(MockLLM { reply: reply.map(str::to_string) }))
    }

    #[tokio::test]
    async fn test_generated_cypher_runs_verbatim() {
        let graph = canned(Ok(QueryResult {
            columns: vec!["patients".into()],
            rows: vec![vec![json!(1000)]],
        }));
        let service = QueryService::new(graph.clone(), llm(Some("```cypher\nMATCH (p:Patient) RETURN count(p) AS patients\n```")));

        let answer = service.ask("How many patients are there?").await;
        assert!(!answer.fallback);
        assert_eq!(answer.source, AnswerSource::Generated);
        assert_eq!(answer.cypher.as_deref(), Some("MATCH (p:Patient) RETURN count(p) AS patients"));
        assert_eq!(answer.rows, vec![vec![json!(1000)]]);
        assert_eq!(graph.seen.lock().unwrap().as_slice(), ["MATCH (p:Patient) RETURN count(p) AS patients"]);
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back() {
        let graph = canned(Ok(QueryResult::default()));
        let service = QueryService::new(graph.clone(), llm(None));

        let answer = service.ask("Which drugs?").await;
        assert!(answer.fallback);
        assert_eq!(answer.message.as_deref(), Some(FALLBACK_MESSAGE));
        assert!(answer.cypher.is_none());
        assert!(graph.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_generation_falls_back() {
        let service = QueryService::new(canned(Ok(QueryResult::default())), llm(Some("```\n```")));
        assert!(service.ask("anything").await.fallback);
    }

    #[tokio::test]
    async fn test_empty_question_falls_back() {
        let graph = canned(Ok(QueryResult::default()));
        let service = QueryService::new(graph.clone(), llm(Some("RETURN 1")));
        assert!(service.ask("   ").await.fallback);
        assert!(graph.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_cypher_falls_back_with_statement() {
        let service = QueryService::new(
            canned(Err("Invalid input 'SELEC'".into())),
            llm(Some("SELEC * FROM patients")),
        );
        let answer = service.ask("list patients").await;
        assert!(answer.fallback);
        assert_eq!(answer.cypher.as_deref(), Some("SELEC * FROM patients"));
    }

    #[tokio::test]
    async fn test_no_rows_message() {
        let service = QueryService::new(canned(Ok(QueryResult::default())), llm(Some("MATCH (n:Nothing) RETURN n")));
        let answer = service.ask("nothing?").await;
        assert!(!answer.fallback);
        assert_eq!(answer.message.as_deref(), Some(NO_ROWS_MESSAGE));
    }

    async fn demo_graph() -> Arc<MemoryGraph> {
        let graph = MemoryGraph::new();
        graph.merge_node(&GraphNode::new("Patient", "P001").with("full_name", "Alice Nguyen")).await.unwrap();
        graph.merge_node(&GraphNode::new("Condition", "E11.9").with("name", "Type 2 diabetes mellitus")).await.unwrap();
        graph.merge_node(&GraphNode::new("Medication", "860975").with("name", "Metformin")).await.unwrap();
        let p = NodeRef::new("Patient", "P001");
        graph.merge_edge(&GraphEdge::new(p.clone(), RelationType::HasCondition, NodeRef::new("Condition", "E11.9"))).await.unwrap();
        graph.merge_edge(&GraphEdge::new(p, RelationType::TakesMedication, NodeRef::new("Medication", "860975"))).await.unwrap();
        Arc::new(graph)
    }

    #[tokio::test]
    async fn test_router_without_llm() {
        let service = QueryService::new(demo_graph().await, None);

        let answer = service.ask("show medications for patient p001").await;
        assert_eq!(answer.source, AnswerSource::Router);
        assert_eq!(answer.columns, vec!["patient_id", "full_name", "rxnorm", "medication"]);
        assert_eq!(answer.rows[0][3], json!("Metformin"));
        assert_eq!(answer.message.as_deref(), Some("Medications for patient P001:"));

        let answer = service.ask("show patients with asthma").await;
        assert!(answer.rows.is_empty());
        assert!(answer.message.unwrap().contains("asthma"));

        let answer = service.ask("what is the mean age?").await;
        assert_eq!(answer.message.as_deref(), Some(HELP_TEXT));
        assert!(!answer.fallback);
    }

    #[tokio::test]
    async fn test_memory_graph_rejects_free_cypher() {
        let service = QueryService::new(demo_graph().await, llm(Some("MATCH (n) RETURN n")));
        let answer = service.ask("show everything").await;
        assert!(answer.fallback);
    }

    #[tokio::test]
    async fn test_structured_query_on_memory_graph() {
        let service = QueryService::new(demo_graph().await, None);
        let answer = service
            .run_structured(&StructuredQuery::MedicationsForCondition { term: "diabetes".into() })
            .await;
        assert_eq!(answer.source, AnswerSource::Structured);
        assert_eq!(answer.rows, vec![vec![json!("860975"), json!("Metformin"), json!(1)]]);
    }
}
