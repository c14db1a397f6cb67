use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    Relational,
    PropertyGraph,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphDbConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub db_type: DbType,
    /// Connection string for the relational backend.
    pub connection: String,
    /// Credentials for the property-graph backend.
    pub graph: Option<GraphDbConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    pub connection: String,
    /// Embedding dimension of the backing collection.
    pub vector_size: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkerConfig {
    pub lines_per_split: usize,
    pub tokens_per_paragraph: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            lines_per_split: 100,
            tokens_per_paragraph: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub search_limit: usize,
    pub search_min_relevance: f32,
    pub node_depth: usize,
    pub max_nodes: usize,
    pub max_tokens: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            search_limit: 5,
            search_min_relevance: 0.5,
            node_depth: 3,
            max_nodes: 100,
            max_tokens: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub vector: VectorConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("GRAPHMIND"));

        builder.build()?.try_deserialize()
    }
}
