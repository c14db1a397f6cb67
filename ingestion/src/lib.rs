pub mod chunker;
pub mod ingestor;

pub use chunker::TextChunker;
pub use ingestor::{GraphIngestor, IngestError};
