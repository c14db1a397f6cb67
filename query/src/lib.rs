pub mod engine;
pub mod subgraph;

pub use engine::{GraphEngine, GraphView, QueryError};
pub use subgraph::{estimate_tokens, QuerySubgraph};
