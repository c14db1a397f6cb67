pub mod config;
pub mod embedding;
pub mod error;
pub mod model;
pub mod semantic;
pub mod vector;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default verbosity when `RUST_LOG` is unset: the engine crates at debug,
/// the backend client crates quieted to warnings so connection chatter does
/// not drown ingest and query logs.
const DEFAULT_LOG_FILTER: &str = "info,graphmind_core=debug,storage=debug,ingestion=debug,\
                                  query=debug,neo4rs=warn,sqlx=warn,qdrant_client=warn";

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Targets stay on: with four crates logging, the module path is the
    // fastest way to tell an ingest line from a storage line.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}
