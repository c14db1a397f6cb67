use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, typed, described vertex in the knowledge graph.
///
/// `(index, name)` is a soft uniqueness key: ingest enforces it by merging
/// descriptions rather than rejecting duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub index: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub desc: String,
}

impl Node {
    pub fn new(
        index: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            index: index.into(),
            name: name.into(),
            kind: kind.into(),
            desc: desc.into(),
        }
    }

    /// Canonical payload stored in the vector memory for this node.
    pub fn embed_text(&self) -> String {
        embed_text(&self.name, &self.kind, &self.desc)
    }
}

/// Renders the canonical vector payload for a (name, type, desc) triple.
pub fn embed_text(name: &str, kind: &str, desc: &str) -> String {
    format!("Name:{};Type:{};Desc:{}", name, kind, desc)
}

/// A labelled connection between two nodes of the same index.
///
/// Stored with the direction the model authored; treated as undirected for
/// deduplication and community detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub index: String,
    pub source: String,
    pub target: String,
    pub relationship: String,
}

impl Edge {
    pub fn new(
        index: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            index: index.into(),
            source: source.into(),
            target: target.into(),
            relationship: relationship.into(),
        }
    }
}

/// Assigns a node to a community produced by the latest detection run.
/// `community_id` is not stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityMembership {
    pub index: String,
    pub community_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub community_id: String,
    pub index: String,
    pub summaries: String,
}

/// At most one per index; regenerated from the current community set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub index: String,
    pub summaries: String,
}
