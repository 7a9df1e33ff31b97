use anyhow::{Result, anyhow};
use async_trait::async_trait;
use medigraph_common::config::{AppConfig, DEFAULT_WAREHOUSE_TIMEOUT_SECS, DEFAULT_WAREHOUSE_TOKEN_TYPE};
use medigraph_common::{EntityKind, Row};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use super::{Warehouse, WarehouseInfo};

const STATEMENTS_PATH: &str = "/api/v2/statements";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_POLLS: u32 = 240;

#[derive(Debug, Clone, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    statement_handle: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<ColumnType>,
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnType {
    name: String,
}

/// Warehouse reached through the Snowflake SQL REST API.
///
/// Authentication is a bearer token (programmatic access token, OAuth token
/// or key-pair JWT) whose kind is sent in
/// `X-Snowflake-Authorization-Token-Type`.
pub struct SqlApiWarehouse {
    client: Client,
    base_url: String,
    token: String,
    token_type: String,
    warehouse: Option<String>,
    database: String,
    schema: String,
    role: Option<String>,
    timeout_secs: u64,
}

/// Client-side timeout leaves room past the server-side statement timeout.
fn http_client(statement_timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(statement_timeout_secs + 10))
        .build()
        .unwrap_or_default()
}

impl SqlApiWarehouse {
    pub fn new(base_url: String, token: String, database: String, schema: String) -> Self {
        Self::with_timeout(base_url, token, database, schema, DEFAULT_WAREHOUSE_TIMEOUT_SECS)
    }

    fn with_timeout(base_url: String, token: String, database: String, schema: String, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            token_type: DEFAULT_WAREHOUSE_TOKEN_TYPE.to_string(),
            warehouse: None,
            database,
            schema,
            role: None,
            timeout_secs,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let base_url = config
            .warehouse_base_url()
            .ok_or_else(|| anyhow!("SNOWFLAKE_ACCOUNT (or SNOWFLAKE_HOST) is not set"))?;
        let token = config
            .warehouse
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("SNOWFLAKE_TOKEN is not set"))?;
        let wh = &config.warehouse;

        Ok(Self {
            token_type: wh.token_type.clone(),
            warehouse: wh.warehouse.clone(),
            role: wh.role.clone(),
            ..Self::with_timeout(base_url, token, wh.database.clone(), wh.schema.clone(), wh.timeout_secs)
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-Snowflake-Authorization-Token-Type", &self.token_type)
            .header("Accept", "application/json")
            .header("User-Agent", concat!("medigraph/", env!("CARGO_PKG_VERSION")))
    }

    async fn read_response(res: reqwest::Response) -> Result<(StatusCode, StatementResponse)> {
        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<StatementResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(body);
            return Err(anyhow!("Snowflake SQL API error ({}): {}", status, message));
        }

        let parsed: StatementResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse Snowflake response: {} - body: {}", e, body))?;
        Ok((status, parsed))
    }

    /// Runs one statement and returns every row across all result partitions.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let url = format!("{}{}", self.base_url, STATEMENTS_PATH);
        let req = StatementRequest {
            statement: sql,
            timeout: self.timeout_secs,
            database: &self.database,
            schema: &self.schema,
            warehouse: self.warehouse.as_deref(),
            role: self.role.as_deref(),
        };

        tracing::debug!("Snowflake statement: {}", sql);
        let res = self.authorized(self.client.post(&url)).json(&req).send().await?;
        let (mut status, mut response) = Self::read_response(res).await?;

        // 202 means the statement is still running; poll its handle.
        let mut polls = 0;
        while status == StatusCode::ACCEPTED {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(anyhow!("Snowflake statement did not finish in time: {}", sql));
            }
            let handle = response
                .statement_handle
                .clone()
                .ok_or_else(|| anyhow!("Snowflake accepted the statement without a handle"))?;
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            let res = self
                .authorized(self.client.get(format!("{}/{}", url, handle)))
                .send()
                .await?;
            (status, response) = Self::read_response(res).await?;
        }

        let meta = response
            .result_set_meta_data
            .ok_or_else(|| anyhow!("Snowflake response has no result set metadata"))?;
        let columns: Vec<String> = meta.row_type.iter().map(|c| c.name.to_ascii_uppercase()).collect();

        let mut data = response.data;
        if meta.partition_info.len() > 1 {
            let handle = response
                .statement_handle
                .ok_or_else(|| anyhow!("Partitioned Snowflake result without a statement handle"))?;
            for partition in 1..meta.partition_info.len() {
                let res = self
                    .authorized(self.client.get(format!("{}/{}", url, handle)))
                    .query(&[("partition", partition)])
                    .send()
                    .await?;
                let (_, page) = Self::read_response(res).await?;
                data.extend(page.data);
            }
        }

        Ok(data.into_iter().map(|values| to_row(&columns, values)).collect())
    }

    async fn first_cell(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.query(sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|(_, v)| v.as_str().map(str::to_string)))
    }
}

fn to_row(columns: &[String], values: Vec<Option<String>>) -> Row {
    columns
        .iter()
        .cloned()
        .zip(values)
        .map(|(name, value)| {
            let value = value.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null);
            (name, value)
        })
        .collect()
}

#[async_trait]
impl Warehouse for SqlApiWarehouse {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    async fn ping(&self) -> Result<WarehouseInfo> {
        let rows = self
            .query("SELECT current_account() AS ACCOUNT, current_region() AS REGION, current_warehouse() AS WAREHOUSE, current_database() AS DATABASE, current_schema() AS SCHEMA")
            .await?;
        let row = rows.into_iter().next().ok_or_else(|| anyhow!("Snowflake returned no session row"))?;
        let get = |k: &str| row.get(k).and_then(|v| v.as_str()).map(str::to_string);
        Ok(WarehouseInfo {
            account: get("ACCOUNT"),
            region: get("REGION"),
            warehouse: get("WAREHOUSE"),
            database: get("DATABASE"),
            schema: get("SCHEMA"),
        })
    }

    async fn count_rows(&self, kind: EntityKind) -> Result<u64> {
        let sql = super::count_sql(kind, &self.database, &self.schema);
        let cell = self.first_cell(&sql).await?.ok_or_else(|| anyhow!("Empty count for {}", kind))?;
        cell.trim()
            .parse::<u64>()
            .map_err(|e| anyhow!("Non-numeric count for {}: {} ({})", kind, cell, e))
    }

    async fn fetch_rows(&self, kind: EntityKind, limit: usize) -> Result<Vec<Row>> {
        let sql = super::select_sql(kind, &self.database, &self.schema, limit);
        self.query(&sql).await
    }
}
