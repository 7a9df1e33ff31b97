use serde::{Deserialize, Serialize};
use std::env;
use config::{Config, ConfigError, File, Environment};

// --- Constants for Default Configuration ---
pub const DEFAULT_MAX_ROWS_PER_ENTITY: usize = 7000;
pub const DEFAULT_PROGRESS_EVERY: usize = 500;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_LLM_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_WAREHOUSE_DATABASE: &str = "MEDIGRAPH";
pub const DEFAULT_WAREHOUSE_SCHEMA: &str = "PUBLIC";
pub const DEFAULT_WAREHOUSE_TOKEN_TYPE: &str = "PROGRAMMATIC_ACCESS_TOKEN";
pub const DEFAULT_WAREHOUSE_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_GRAPH_DATABASE: &str = "neo4j";

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8501";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Shows only the last four characters of a secret, for logs.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    Gemini,
}

impl LLMProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            LLMProvider::OpenAI => DEFAULT_OPENAI_MODEL,
            LLMProvider::Gemini => DEFAULT_GEMINI_MODEL,
        }
    }
}

/// When a whole entity kind is left untouched by a load pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Skip the kind when any node with its label already exists.
    LabelPresent,
    /// Always process rows; merge-by-identity keeps reruns idempotent.
    Never,
}

impl std::str::FromStr for SkipPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "label_present" | "label" => Ok(SkipPolicy::LabelPresent),
            "never" | "none" => Ok(SkipPolicy::Never),
            other => Err(format!("unknown skip policy: {}", other)),
        }
    }
}

/// Which backends the dashboard talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Built-in fixture rows and an in-process graph.
    Demo,
    /// Snowflake SQL API and Neo4j over Bolt.
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    /// Falls back to the provider's default model when unset.
    #[serde(default)]
    pub model: Option<String>,
    pub temperature: f32,
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub account: Option<String>,
    /// Overrides the `<account>.snowflakecomputing.com` host.
    #[serde(default)]
    pub host: Option<String>,
    pub user: Option<String>,
    pub token: Option<String>,
    pub token_type: String,
    pub warehouse: Option<String>,
    pub database: String,
    pub schema: String,
    pub role: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub max_rows_per_entity: usize,
    pub skip_policy: SkipPolicy,
    pub progress_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub mode: RunMode,
    pub http_addr: String,
    #[serde(default)]
    pub static_dir: Option<String>,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LLMConfig,
    pub warehouse: WarehouseConfig,
    pub graph: GraphConfig,
    pub etl: EtlConfig,
    pub server: ServerConfig,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            openai_api_key: None,
            google_api_key: None,
            model: None,
            temperature: DEFAULT_LLM_TEMPERATURE,
            base_url: None,
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            account: None,
            host: None,
            user: None,
            token: None,
            token_type: DEFAULT_WAREHOUSE_TOKEN_TYPE.to_string(),
            warehouse: None,
            database: DEFAULT_WAREHOUSE_DATABASE.to_string(),
            schema: DEFAULT_WAREHOUSE_SCHEMA.to_string(),
            role: None,
            timeout_secs: DEFAULT_WAREHOUSE_TIMEOUT_SECS,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: None,
            user: None,
            password: None,
            database: DEFAULT_GRAPH_DATABASE.to_string(),
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            max_rows_per_entity: DEFAULT_MAX_ROWS_PER_ENTITY,
            skip_policy: SkipPolicy::LabelPresent,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Demo,
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            static_dir: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LLMConfig::default(),
            warehouse: WarehouseConfig::default(),
            graph: GraphConfig::default(),
            etl: EtlConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// `MEDIGRAPH_<SECTION>__<KEY>` variables.
fn environment() -> Environment {
    Environment::with_prefix("MEDIGRAPH")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            // Default settings
            .set_default("llm.provider", "openai")?
            .set_default("llm.temperature", DEFAULT_LLM_TEMPERATURE as f64)?
            .set_default("llm.timeout_secs", DEFAULT_LLM_TIMEOUT_SECS)?
            .set_default("warehouse.token_type", DEFAULT_WAREHOUSE_TOKEN_TYPE)?
            .set_default("warehouse.database", DEFAULT_WAREHOUSE_DATABASE)?
            .set_default("warehouse.schema", DEFAULT_WAREHOUSE_SCHEMA)?
            .set_default("warehouse.timeout_secs", DEFAULT_WAREHOUSE_TIMEOUT_SECS)?
            .set_default("graph.database", DEFAULT_GRAPH_DATABASE)?
            .set_default("etl.max_rows_per_entity", DEFAULT_MAX_ROWS_PER_ENTITY as i64)?
            .set_default("etl.skip_policy", "label_present")?
            .set_default("etl.progress_every", DEFAULT_PROGRESS_EVERY as i64)?
            .set_default("server.mode", "demo")?
            .set_default("server.http_addr", DEFAULT_HTTP_ADDR)?
            .set_default("server.cache_ttl_secs", DEFAULT_CACHE_TTL_SECS)?

            // File: config.toml
            .add_source(File::with_name("config").required(false))

            // Environment: MEDIGRAPH_ETL__SKIP_POLICY=never -> etl.skip_policy=never
            .add_source(environment())

            // Plain variable names, as found in existing .env files
            .set_override_option("llm.openai_api_key", env::var("OPENAI_API_KEY").ok())?
            .set_override_option("llm.google_api_key", env::var("GOOGLE_API_KEY").ok())?
            .set_override_option("llm.model", env::var("OPENAI_MODEL").ok())?
            .set_override_option("warehouse.account", env::var("SNOWFLAKE_ACCOUNT").ok())?
            .set_override_option("warehouse.host", env::var("SNOWFLAKE_HOST").ok())?
            .set_override_option("warehouse.user", env::var("SNOWFLAKE_USER").ok())?
            .set_override_option("warehouse.token", env::var("SNOWFLAKE_TOKEN").ok())?
            .set_override_option("warehouse.warehouse", env::var("SNOWFLAKE_WAREHOUSE").ok())?
            .set_override_option("warehouse.database", env::var("SNOWFLAKE_DATABASE").ok())?
            .set_override_option("warehouse.schema", env::var("SNOWFLAKE_SCHEMA").ok())?
            .set_override_option("warehouse.role", env::var("SNOWFLAKE_ROLE").ok())?
            .set_override_option("graph.uri", env::var("NEO4J_URI").ok())?
            .set_override_option("graph.user", env::var("NEO4J_USER").ok())?
            .set_override_option("graph.password", env::var("NEO4J_PASSWORD").ok())?
            .set_override_option(
                "etl.max_rows_per_entity",
                env::var("MAX_ROWS_PER_ENTITY").ok().and_then(|v| v.parse::<i64>().ok()),
            )?

            .build()?;

        s.try_deserialize()
    }

    pub fn get_active_key(&self) -> Option<String> {
        let key = match self.llm.provider {
            LLMProvider::OpenAI => self.llm.openai_api_key.clone(),
            LLMProvider::Gemini => self.llm.google_api_key.clone(),
        };
        key.filter(|k| !k.trim().is_empty())
    }

    pub fn get_model_name(&self) -> String {
        self.llm
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.llm.provider.default_model().to_string())
    }

    pub fn get_base_url(&self) -> Option<String> {
        if let Some(url) = &self.llm.base_url {
            return Some(url.clone());
        }
        match self.llm.provider {
            LLMProvider::OpenAI => None,
            LLMProvider::Gemini => Some("https://generativelanguage.googleapis.com".to_string()),
        }
    }

    /// Base URL of the warehouse SQL API, if enough is configured to build one.
    pub fn warehouse_base_url(&self) -> Option<String> {
        if let Some(host) = self.warehouse.host.as_deref().filter(|h| !h.is_empty()) {
            return Some(if host.starts_with("http") {
                host.trim_end_matches('/').to_string()
            } else {
                format!("https://{}", host.trim_end_matches('/'))
            });
        }
        self.warehouse
            .account
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| format!("https://{}.snowflakecomputing.com", a))
    }

    /// Settings live mode cannot run without, by their environment variable name.
    pub fn missing_live_settings(&self) -> Vec<&'static str> {
        fn blank(v: &Option<String>) -> bool {
            v.as_deref().map_or(true, |s| s.trim().is_empty())
        }

        let mut missing = Vec::new();
        if self.warehouse_base_url().is_none() {
            missing.push("SNOWFLAKE_ACCOUNT");
        }
        if blank(&self.warehouse.token) {
            missing.push("SNOWFLAKE_TOKEN");
        }
        if blank(&self.graph.uri) {
            missing.push("NEO4J_URI");
        }
        if blank(&self.graph.user) {
            missing.push("NEO4J_USER");
        }
        if blank(&self.graph.password) {
            missing.push("NEO4J_PASSWORD");
        }
        missing
    }

    /// The effective configuration with every secret masked.
    pub fn redacted(&self) -> serde_json::Value {
        fn mask(v: &Option<String>) -> serde_json::Value {
            match v.as_deref() {
                Some(s) if !s.is_empty() => serde_json::Value::String("***".into()),
                _ => serde_json::Value::Null,
            }
        }

        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        value["llm"]["openai_api_key"] = mask(&self.llm.openai_api_key);
        value["llm"]["google_api_key"] = mask(&self.llm.google_api_key);
        value["warehouse"]["token"] = mask(&self.warehouse.token);
        value["graph"]["password"] = mask(&self.graph.password);
        value
    }
}
