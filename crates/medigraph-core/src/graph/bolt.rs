use anyhow::{Context, Result};
use async_trait::async_trait;
use medigraph_common::config::GraphConfig;
use medigraph_common::{
    EdgeRow, EntityKind, GraphEdge, GraphNode, NodeRef, Properties, QueryResult, GUIDELINE_LABEL,
};
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    ConfigBuilder, Graph, Query,
};
use serde_json::Value;
use super::{check_identifier, EdgeWrite, GraphStore, RelationCount};
use crate::query::StructuredQuery;

/// Neo4j (or AuraDB) reached over Bolt.
pub struct BoltGraph {
    graph: Graph,
    database: String,
}

impl BoltGraph {
    pub async fn connect(uri: &str, user: &str, password: &str, database: &str) -> Result<Self> {
        tracing::debug!("Connecting to Neo4j at {} as {} (db={})", uri, user, database);
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .build()
            .context("Invalid Neo4j connection settings")?;
        let graph = Graph::connect(config)
            .await
            .with_context(|| format!("Failed to connect to Neo4j at {}", uri))?;
        Ok(Self { graph, database: database.to_string() })
    }

    pub async fn from_config(config: &GraphConfig) -> Result<Self> {
        let uri = config.uri.as_deref().context("NEO4J_URI is not set")?;
        let user = config.user.as_deref().context("NEO4J_USER is not set")?;
        let password = config.password.as_deref().context("NEO4J_PASSWORD is not set")?;
        Self::connect(uri, user, password, &config.database).await
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn single_count(&self, q: Query) -> Result<u64> {
        let mut result = self.graph.execute(q).await?;
        match result.next().await? {
            Some(row) => Ok(row.get::<i64>("c")?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn edge_rows(&self, q: Query) -> Result<Vec<EdgeRow>> {
        let mut result = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await? {
            rows.push(row.to::<EdgeRow>()?);
        }
        Ok(rows)
    }

    /// Collects every row. Rows arrive keyed by name with their order lost,
    /// so `columns` fixes the order of each row's values.
    async fn table(&self, q: Query, columns: Option<Vec<String>>) -> Result<QueryResult> {
        let mut result = self.graph.execute(q).await?;
        let mut table = QueryResult { columns: columns.unwrap_or_default(), rows: Vec::new() };
        let mut first = true;
        while let Some(row) = result.next().await? {
            let record = row.to::<serde_json::Map<String, Value>>()?;
            if first {
                table.columns = settle_columns(std::mem::take(&mut table.columns), &record);
                first = false;
            }
            table.rows.push(row_values(&table.columns, &record));
        }
        Ok(table)
    }
}

/// Keeps the expected column names when they are exactly the row's keys,
/// otherwise falls back to the keys in sorted order.
fn settle_columns(expected: Vec<String>, record: &serde_json::Map<String, Value>) -> Vec<String> {
    if !expected.is_empty() && expected.len() == record.len() && expected.iter().all(|c| record.contains_key(c)) {
        return expected;
    }
    let mut keys: Vec<String> = record.keys().cloned().collect();
    keys.sort();
    keys
}

fn row_values(columns: &[String], record: &serde_json::Map<String, Value>) -> Vec<Value> {
    columns.iter().map(|c| record.get(c).cloned().unwrap_or(Value::Null)).collect()
}

/// Blanks out string literals, quoted names and anything nested in
/// brackets, and upper-cases the rest, keeping byte offsets intact.
fn top_level_mask(cypher: &str) -> Vec<u8> {
    let mut mask = Vec::with_capacity(cypher.len());
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for &b in cypher.as_bytes() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' && q != b'`' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            mask.push(b' ');
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => {
                quote = Some(b);
                mask.push(b' ');
            }
            b'(' | b'[' | b'{' => {
                depth += 1;
                mask.push(b' ');
            }
            b')' | b']' | b'}' => {
                depth = depth.saturating_sub(1);
                mask.push(b' ');
            }
            _ if depth > 0 => mask.push(b' '),
            _ => mask.push(b.to_ascii_uppercase()),
        }
    }
    mask
}

fn keyword_positions(mask: &[u8], keyword: &str) -> Vec<usize> {
    let kw = keyword.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    mask.windows(kw.len())
        .enumerate()
        .filter(|&(i, w)| {
            w == kw && (i == 0 || !is_word(mask[i - 1])) && mask.get(i + kw.len()).map_or(true, |&b| !is_word(b))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Column names of the last RETURN clause, in projection order: the alias
/// after `AS`, or the expression text itself. `None` when there is no
/// RETURN or it projects `*`.
pub fn return_columns(cypher: &str) -> Option<Vec<String>> {
    let mask = top_level_mask(cypher);
    let start = *keyword_positions(&mask, "RETURN").last()? + "RETURN".len();
    let end = ["ORDER", "SKIP", "LIMIT", "UNION"]
        .iter()
        .filter_map(|kw| keyword_positions(&mask, kw).into_iter().find(|&p| p > start))
        .min()
        .unwrap_or(cypher.len());

    let mut bounds = Vec::new();
    let mut item_start = start;
    for i in start..end {
        if mask[i] == b',' {
            bounds.push((item_start, i));
            item_start = i + 1;
        }
    }
    bounds.push((item_start, end));

    let mut columns = Vec::with_capacity(bounds.len());
    for (n, (mut from, to)) in bounds.into_iter().enumerate() {
        if n == 0 {
            if let Some(&p) = keyword_positions(&mask[from..to], "DISTINCT").first() {
                if mask[from..from + p].iter().all(|b| b.is_ascii_whitespace()) {
                    from += p + "DISTINCT".len();
                }
            }
        }
        let name = match keyword_positions(&mask[from..to], "AS").last() {
            Some(&p) => cypher[from + p + 2..to].trim().trim_matches('`'),
            None => cypher[from..to].trim(),
        };
        let name = name.trim_end_matches(';').trim();
        if name.is_empty() || name == "*" {
            return None;
        }
        columns.push(name.to_string());
    }
    Some(columns)
}

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => BoltType::String(BoltString::new(s)),
        Value::Array(items) => BoltType::List(BoltList::from(items.iter().map(to_bolt).collect::<Vec<_>>())),
        Value::Object(map) => {
            let mut bolt = BoltMap::new();
            for (k, v) in map {
                bolt.put(BoltString::new(k), to_bolt(v));
            }
            BoltType::Map(bolt)
        }
    }
}

fn properties_to_bolt(properties: &Properties) -> BoltType {
    let mut bolt = BoltMap::new();
    for (k, v) in properties {
        bolt.put(BoltString::new(k), to_bolt(v));
    }
    BoltType::Map(bolt)
}

fn with_params(mut q: Query, params: &Properties) -> Query {
    for (name, value) in params {
        q = q.param(name, to_bolt(value));
    }
    q
}

/// Statements run by `ensure_schema`, one per constraint or index.
pub fn schema_statements() -> Vec<String> {
    let labels = EntityKind::LOAD_ORDER
        .iter()
        .map(|k| k.as_str())
        .chain(std::iter::once(GUIDELINE_LABEL));

    let mut statements: Vec<String> = labels
        .map(|label| {
            let key = medigraph_common::key_property(label);
            format!(
                "CREATE CONSTRAINT {}_{}_unique IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
                label.to_lowercase(),
                key,
                label,
                key
            )
        })
        .collect();

    for kind in [EntityKind::Condition, EntityKind::Medication] {
        statements.push(format!(
            "CREATE INDEX {}_name IF NOT EXISTS FOR (n:{}) ON (n.name)",
            kind.as_str().to_lowercase(),
            kind.as_str()
        ));
    }
    statements
}

pub fn merge_node_cypher(label: &str, key_property: &str) -> Result<String> {
    Ok(format!(
        "MERGE (n:{} {{{}: $key}}) \
         ON CREATE SET n.__created = true \
         WITH n, coalesce(n.__created, false) AS created \
         REMOVE n.__created \
         SET n += $props \
         RETURN created",
        check_identifier(label)?,
        check_identifier(key_property)?
    ))
}

pub fn merge_edge_cypher(edge: &GraphEdge) -> Result<String> {
    Ok(format!(
        "MATCH (a:{} {{{}: $source}}) \
         MATCH (b:{} {{{}: $target}}) \
         MERGE (a)-[r:{}]->(b) \
         ON CREATE SET r.__created = true \
         WITH r, coalesce(r.__created, false) AS created \
         REMOVE r.__created \
         SET r += $props \
         RETURN created",
        check_identifier(&edge.source.label)?,
        check_identifier(edge.source.key_property())?,
        check_identifier(&edge.target.label)?,
        check_identifier(edge.target.key_property())?,
        edge.relation.as_str()
    ))
}

const NODE_ID: &str = "coalesce(toString(n.id), toString(n.code), elementId(n))";
const NEIGHBOUR_ID: &str = "coalesce(toString(m.id), toString(m.code), elementId(m))";

#[async_trait]
impl GraphStore for BoltGraph {
    fn name(&self) -> &'static str {
        "neo4j"
    }

    async fn ping(&self) -> Result<()> {
        let mut result = self.graph.execute(query("RETURN 1 AS ok")).await?;
        result.next().await?.context("Neo4j returned no row for RETURN 1")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in schema_statements() {
            tracing::debug!("Schema: {}", statement);
            self.graph.run(query(&statement)).await?;
        }
        Ok(())
    }

    async fn count_nodes(&self, label: &str) -> Result<u64> {
        let cypher = format!("MATCH (n:{}) RETURN count(n) AS c", check_identifier(label)?);
        self.single_count(query(&cypher)).await
    }

    async fn node_exists(&self, node: &NodeRef) -> Result<bool> {
        let cypher = format!(
            "MATCH (n:{} {{{}: $key}}) RETURN count(n) AS c",
            check_identifier(&node.label)?,
            check_identifier(node.key_property())?
        );
        Ok(self.single_count(query(&cypher).param("key", node.key.as_str())).await? > 0)
    }

    async fn merge_node(&self, node: &GraphNode) -> Result<bool> {
        let cypher = merge_node_cypher(&node.label, node.reference().key_property())?;
        let q = query(&cypher)
            .param("key", node.key.as_str())
            .param("props", properties_to_bolt(&node.properties));
        let mut result = self.graph.execute(q).await?;
        let row = result
            .next()
            .await?
            .with_context(|| format!("MERGE returned nothing for {}", node.reference()))?;
        Ok(row.get::<bool>("created")?)
    }

    async fn merge_edge(&self, edge: &GraphEdge) -> Result<EdgeWrite> {
        let cypher = merge_edge_cypher(edge)?;
        let q = query(&cypher)
            .param("source", edge.source.key.as_str())
            .param("target", edge.target.key.as_str())
            .param("props", properties_to_bolt(&edge.properties));
        let mut result = self.graph.execute(q).await?;
        match result.next().await? {
            Some(row) if row.get::<bool>("created")? => Ok(EdgeWrite::Created),
            Some(_) => Ok(EdgeWrite::Existing),
            None => Ok(EdgeWrite::MissingEndpoint),
        }
    }

    async fn relationship_counts(&self) -> Result<Vec<RelationCount>> {
        let q = query(
            "MATCH ()-[r]->() RETURN type(r) AS relationship_type, count(r) AS total ORDER BY total DESC",
        );
        let mut result = self.graph.execute(q).await?;
        let mut counts = Vec::new();
        while let Some(row) = result.next().await? {
            counts.push(RelationCount {
                relationship_type: row.get::<String>("relationship_type")?,
                total: row.get::<i64>("total")?.max(0) as u64,
            });
        }
        Ok(counts)
    }

    async fn sample_edges(&self, limit: usize) -> Result<Vec<EdgeRow>> {
        let cypher = format!(
            "MATCH (n)-[r]->(m) \
             RETURN {} AS start_id, coalesce(labels(n)[0], 'Node') AS start_label, type(r) AS relationship_type, \
             {} AS end_id, coalesce(labels(m)[0], 'Node') AS end_label \
             LIMIT $limit",
            NODE_ID, NEIGHBOUR_ID
        );
        self.edge_rows(query(&cypher).param("limit", limit as i64)).await
    }

    async fn neighbourhood(&self, node: &NodeRef, limit: usize) -> Result<Vec<EdgeRow>> {
        let cypher = format!(
            "MATCH (n:{} {{{}: $key}})-[r]-(m) \
             RETURN {} AS start_id, coalesce(labels(n)[0], 'Node') AS start_label, type(r) AS relationship_type, \
             {} AS end_id, coalesce(labels(m)[0], 'Node') AS end_label \
             LIMIT $limit",
            check_identifier(&node.label)?,
            check_identifier(node.key_property())?,
            NODE_ID,
            NEIGHBOUR_ID
        );
        self.edge_rows(query(&cypher).param("key", node.key.as_str()).param("limit", limit as i64))
            .await
    }

    async fn find_nodes(&self, label: &str, property: &str, needle: &str) -> Result<Vec<GraphNode>> {
        let key = medigraph_common::key_property(label);
        let cypher = format!(
            "MATCH (n:{}) WHERE n.{} IS NOT NULL AND toLower(toString(n.{})) CONTAINS toLower($needle) \
             RETURN toString(n.{}) AS key, properties(n) AS props",
            check_identifier(label)?,
            check_identifier(property)?,
            property,
            key
        );
        let mut result = self.graph.execute(query(&cypher).param("needle", needle)).await?;
        let mut nodes = Vec::new();
        while let Some(row) = result.next().await? {
            nodes.push(GraphNode {
                label: label.to_string(),
                key: row.get::<String>("key")?,
                properties: row.get::<Properties>("props")?,
            });
        }
        Ok(nodes)
    }

    async fn run_query(&self, cypher: &str, params: &Properties) -> Result<QueryResult> {
        tracing::debug!("Running Cypher: {}", cypher);
        self.table(with_params(query(cypher), params), return_columns(cypher)).await
    }

    async fn run_structured(&self, q: &StructuredQuery) -> Result<QueryResult> {
        let columns = q.columns().iter().map(|c| c.to_string()).collect();
        self.table(with_params(query(q.cypher()), &q.params()), Some(columns)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medigraph_common::RelationType;
    use serde_json::json;

    #[test]
    fn test_merge_node_cypher() {
        let cypher = merge_node_cypher("Condition", "code").unwrap();
        assert!(cypher.starts_with("MERGE (n:Condition {code: $key})"));
        assert!(cypher.contains("SET n += $props"));
        assert!(merge_node_cypher("Bad Label", "id").is_err());
    }

    #[test]
    fn test_merge_edge_cypher_matches_endpoints() {
        let edge = GraphEdge::new(
            NodeRef::new("Patient", "P001"),
            RelationType::TakesMedication,
            NodeRef::new("Medication", "860975"),
        );
        let cypher = merge_edge_cypher(&edge).unwrap();
        assert!(cypher.contains("MATCH (a:Patient {id: $source})"));
        assert!(cypher.contains("MATCH (b:Medication {code: $target})"));
        assert!(cypher.contains("MERGE (a)-[r:TAKES_MEDICATION]->(b)"));
        assert!(!cypher.contains("MERGE (a:"));
    }

    #[test]
    fn test_schema_statements_cover_every_label() {
        let statements = schema_statements();
        assert_eq!(statements.len(), 9);
        assert!(statements.contains(
            &"CREATE CONSTRAINT patient_id_unique IF NOT EXISTS FOR (n:Patient) REQUIRE n.id IS UNIQUE".to_string()
        ));
        assert!(statements.iter().any(|s| s.contains("FOR (n:Guideline) REQUIRE n.id")));
        assert!(statements.iter().any(|s| s.contains("FOR (n:Medication) REQUIRE n.code")));
    }

    #[test]
    fn test_to_bolt_numbers() {
        assert!(matches!(to_bolt(&json!(45)), BoltType::Integer(_)));
        assert!(matches!(to_bolt(&json!(7.9)), BoltType::Float(_)));
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
        assert!(matches!(to_bolt(&json!({"a": [1, "x"]})), BoltType::Map(_)));
    }

    #[test]
    fn test_return_columns_keep_projection_order() {
        let cypher = "MATCH (p:Patient)-[:HAS_CONDITION]->(c:Condition) \
                      RETURN p.id AS zeta, c.name AS alpha, count(*) AS mid, p.age AS beta \
                      ORDER BY mid DESC LIMIT 10";
        assert_eq!(return_columns(cypher).unwrap(), vec!["zeta", "alpha", "mid", "beta"]);
    }

    #[test]
    fn test_return_columns_expressions_and_nesting() {
        let cypher = "MATCH (p:Patient) WITH p, [x IN range(1, 3) | x] AS xs \
                      RETURN DISTINCT p.first_name, coalesce(p.zip, 'n/a, none') AS `zip code`, \
                      {id: p.id, age: p.age} AS card;";
        assert_eq!(return_columns(cypher).unwrap(), vec!["p.first_name", "zip code", "card"]);

        assert_eq!(return_columns("match (n) return n.name as name limit 5").unwrap(), vec!["name"]);
        assert!(return_columns("MATCH (n) RETURN *").is_none());
        assert!(return_columns("CREATE (n:Tmp)").is_none());
    }

    #[test]
    fn test_row_values_follow_return_order_not_key_order() {
        let cypher = "MATCH (n) RETURN n.z AS zeta, n.a AS alpha, n.m AS mid, n.b AS beta, n.o AS omega, n.g AS gamma";
        // Keys come back with no relation to the RETURN order.
        let mut record = serde_json::Map::new();
        for (key, value) in [("alpha", 1), ("beta", 3), ("gamma", 5), ("mid", 2), ("omega", 4), ("zeta", 0)] {
            record.insert(key.to_string(), json!(value));
        }

        let columns = settle_columns(return_columns(cypher).unwrap(), &record);
        assert_eq!(columns, vec!["zeta", "alpha", "mid", "beta", "omega", "gamma"]);
        assert_eq!(row_values(&columns, &record), vec![json!(0), json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[test]
    fn test_settle_columns_falls_back_to_sorted_keys() {
        let mut record = serde_json::Map::new();
        record.insert("count(p)".to_string(), json!(5));
        record.insert("label".to_string(), json!("Patient"));
        let columns = settle_columns(vec!["label".into(), "count( p )".into()], &record);
        assert_eq!(columns, vec!["count(p)", "label"]);
        assert!(settle_columns(Vec::new(), &serde_json::Map::new()).is_empty());
    }
}
