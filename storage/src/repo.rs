use async_trait::async_trait;
use graphmind_core::error::{ErrorCode, GraphmindError};
use graphmind_core::model::{Community, CommunityMembership, Edge, GlobalSummary, Node};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl GraphmindError for RepoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RepoError::NotFound(_) => ErrorCode::NotFound,
            RepoError::Integrity(_) => ErrorCode::Integrity,
            RepoError::Backend(_) => ErrorCode::Unavailable,
        }
    }
}

/// Index-scoped persistence contract for the knowledge graph. Adapters must
/// reject dangling edges and self-loops with `RepoError::Integrity`.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    async fn insert_node(&self, node: &Node) -> Result<(), RepoError>;

    async fn update_node_desc(&self, index: &str, id: &str, desc: &str) -> Result<(), RepoError>;

    /// All nodes of `index`, in insertion order.
    async fn get_nodes(&self, index: &str) -> Result<Vec<Node>, RepoError>;

    /// Nodes by id, in the order the ids were given; unknown ids are skipped.
    async fn get_nodes_by_ids(&self, ids: &[String]) -> Result<Vec<Node>, RepoError>;

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepoError>;

    async fn update_edge_relationship(
        &self,
        index: &str,
        id: &str,
        relationship: &str,
    ) -> Result<(), RepoError>;

    async fn delete_edge(&self, index: &str, id: &str) -> Result<(), RepoError>;

    /// All edges of `index`, in insertion order.
    async fn get_edges(&self, index: &str) -> Result<Vec<Edge>, RepoError>;

    /// The edge between `a` and `b` in either direction, if any.
    async fn get_edge_between(
        &self,
        index: &str,
        a: &str,
        b: &str,
    ) -> Result<Option<Edge>, RepoError>;

    /// Edges of `index` incident to any of `ids`.
    async fn get_edges_by_node_ids(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<Vec<Edge>, RepoError>;

    /// Wipes all community rows and membership rows for `index` and writes
    /// the given memberships.
    async fn replace_communities(
        &self,
        index: &str,
        memberships: &[CommunityMembership],
    ) -> Result<(), RepoError>;

    async fn upsert_community_summary(&self, community: &Community) -> Result<(), RepoError>;

    async fn get_communities(&self, index: &str) -> Result<Vec<Community>, RepoError>;

    async fn get_memberships(&self, index: &str) -> Result<Vec<CommunityMembership>, RepoError>;

    async fn upsert_global(&self, global: &GlobalSummary) -> Result<(), RepoError>;

    async fn get_global(&self, index: &str) -> Result<Option<GlobalSummary>, RepoError>;

    async fn list_indices(&self) -> Result<Vec<String>, RepoError>;

    /// Bulk delete in referential order: globals, communities, memberships,
    /// edges, nodes.
    async fn delete_index_data(&self, index: &str) -> Result<(), RepoError>;
}

const MAX_ATTEMPTS: usize = 3;
const BASE_DELAY: Duration = Duration::from_millis(100);

/// Runs `op` up to three times, doubling the delay between attempts, while
/// `is_transient` classifies the failure as connectivity-related.
pub(crate) async fn with_backoff<T, E, F, Fut, P>(
    mut op: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && is_transient(&err) => {
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
