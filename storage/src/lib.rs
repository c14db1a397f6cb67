pub mod community;
pub mod graph_db;
pub mod memory;
pub mod relational;
pub mod repo;
pub mod vector;

pub use memory::InMemoryRepository;
pub use repo::{GraphRepository, RepoError};
pub use vector::InMemoryVectorMemory;
