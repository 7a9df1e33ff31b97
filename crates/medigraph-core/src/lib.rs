pub mod engine;
pub mod etl;
pub mod graph;
pub mod llm;
pub mod query;
pub mod seed;
pub mod warehouse;

pub use engine::{HealthReport, MediGraphEngine};
pub use etl::{EtlLoader, EtlReport, LoadOptions, LoadReport, RowFailure};
pub use graph::{BoltGraph, EdgeWrite, GraphStore, MemoryGraph};
pub use llm::{GeminiClient, LLMClient, OpenAIClient};
pub use query::{QueryAnswer, QueryService, StructuredQuery, FALLBACK_MESSAGE};
pub use warehouse::{FixtureWarehouse, SqlApiWarehouse, Warehouse};

// Re-export common types for convenience
pub use medigraph_common::{EntityKind, GraphEdge, GraphNode, NodeRef, RelationType};
