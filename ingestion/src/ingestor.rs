use crate::chunker::TextChunker;
use dashmap::DashMap;
use graphmind_core::config::ChunkerConfig;
use graphmind_core::model::{embed_text, Edge, Node};
use graphmind_core::semantic::{SemanticClient, SemanticError, SourceLabel};
use graphmind_core::vector::{VectorError, VectorMemory};
use std::collections::HashMap;
use std::sync::Arc;
use storage::repo::{GraphRepository, RepoError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Limit and floor for the vector-identity probe during node dedup.
const IDENTITY_SEARCH_LIMIT: usize = 5;
const IDENTITY_MIN_RELEVANCE: f32 = 0.7;

/// Candidate collection bounds for orphan repair.
const ORPHAN_DESC_LIMIT: usize = 10;
const ORPHAN_DESC_MIN_RELEVANCE: f32 = 0.5;
const ORPHAN_NAME_LIMIT: usize = 5;
const ORPHAN_NAME_MIN_RELEVANCE: f32 = 0.6;
const ORPHAN_MIN_CANDIDATES: usize = 3;
const ORPHAN_RESOLVE_LIMIT: usize = 10;
const ORPHAN_INFER_LIMIT: usize = 5;
const ORPHAN_MAX_EDGES: usize = 2;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Semantic(#[from] SemanticError),
}

/// Drives graph construction: extraction, entity dedup, relation inference,
/// orphan repair and edge dedup, one chunk at a time.
///
/// Ingest is serialized per index so concurrent calls cannot race the
/// exact-name dedup into duplicate nodes. Within one call the per-node dedup
/// pass is strictly sequential: each node's outcome is visible to the next
/// node's checks.
pub struct GraphIngestor {
    repo: Arc<dyn GraphRepository>,
    vector: Arc<dyn VectorMemory>,
    semantic: Arc<dyn SemanticClient>,
    chunker: TextChunker,
    index_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GraphIngestor {
    pub fn new(
        repo: Arc<dyn GraphRepository>,
        vector: Arc<dyn VectorMemory>,
        semantic: Arc<dyn SemanticClient>,
    ) -> Self {
        Self {
            repo,
            vector,
            semantic,
            chunker: TextChunker::default(),
            index_locks: DashMap::new(),
        }
    }

    pub fn with_chunker_config(mut self, config: &ChunkerConfig) -> Self {
        self.chunker = TextChunker::new(config);
        self
    }

    /// Extracts a graph from `text` and folds it into `index`.
    ///
    /// Failures past input validation are logged and swallowed so a bad
    /// chunk never stops the surrounding ingest sequence.
    pub async fn insert_graph_data(&self, index: &str, text: &str) -> Result<(), IngestError> {
        validate(index, text)?;

        let lock = self.index_lock(index);
        let _guard = lock.lock().await;

        if let Err(err) = self.ingest_chunk(index, text).await {
            warn!(index, error = %err, "chunk ingest failed, skipping chunk");
        }
        Ok(())
    }

    /// Chunks `text` into overlapping paragraph windows and ingests each
    /// window independently.
    pub async fn insert_chunked(&self, index: &str, text: &str) -> Result<(), IngestError> {
        validate(index, text)?;

        for chunk in self.chunker.chunk(text) {
            self.insert_graph_data(index, &chunk).await?;
        }
        Ok(())
    }

    fn index_lock(&self, index: &str) -> Arc<Mutex<()>> {
        self.index_locks
            .entry(index.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn ingest_chunk(&self, index: &str, text: &str) -> Result<(), IngestError> {
        let extraction = self.semantic.extract_graph(text).await?;

        // Live snapshot: merged and freshly created nodes are appended so
        // node k+1 sees node k's outcome.
        let mut existing = self.repo.get_nodes(index).await?;
        let mut local_to_persisted: HashMap<String, String> = HashMap::new();
        let mut created: Vec<Node> = Vec::new();

        for extracted in &extraction.nodes {
            // Exact-name merge.
            if let Some(pos) = existing.iter().position(|node| node.name == extracted.name) {
                if !extracted.desc.is_empty() {
                    let merged = self
                        .merge_with_fallback(&existing[pos].desc, &extracted.desc)
                        .await?;
                    self.repo
                        .update_node_desc(index, &existing[pos].id, &merged)
                        .await?;
                    existing[pos].desc = merged;
                    let payload = existing[pos].embed_text();
                    self.vector.save(index, &existing[pos].id, &payload).await?;
                }
                local_to_persisted.insert(extracted.local_id.clone(), existing[pos].id.clone());
                continue;
            }

            // Vector-identity merge; anything short of identity becomes a
            // relation candidate for the new node.
            let payload = embed_text(&extracted.name, &extracted.kind, &extracted.desc);
            let hits = self
                .vector
                .search(index, &payload, IDENTITY_SEARCH_LIMIT, IDENTITY_MIN_RELEVANCE)
                .await?;
            if let Some(first) = hits.first() {
                if first.relevance >= 1.0 {
                    local_to_persisted.insert(extracted.local_id.clone(), first.id.clone());
                    continue;
                }
            }
            let potential_related: Vec<String> = hits.into_iter().map(|hit| hit.id).collect();

            let node = Node::new(index, &extracted.name, &extracted.kind, &extracted.desc);
            self.repo.insert_node(&node).await?;
            self.vector.save(index, &node.id, &node.embed_text()).await?;
            local_to_persisted.insert(extracted.local_id.clone(), node.id.clone());
            created.push(node.clone());
            existing.push(node.clone());

            for candidate_id in potential_related {
                let Some(candidate) = existing
                    .iter()
                    .find(|other| other.id == candidate_id)
                    .cloned()
                else {
                    continue;
                };
                self.infer_and_connect(index, &candidate, &node).await?;
            }
        }

        for extracted_edge in &extraction.edges {
            let (Some(source), Some(target)) = (
                local_to_persisted.get(&extracted_edge.source_local_id),
                local_to_persisted.get(&extracted_edge.target_local_id),
            ) else {
                debug!(index, "skipping edge with unresolved endpoint");
                continue;
            };
            self.insert_edge_dropping_integrity(&Edge::new(
                index,
                source.clone(),
                target.clone(),
                extracted_edge.relationship.clone(),
            ))
            .await?;
        }

        for node in &created {
            let edges = self.repo.get_edges(index).await?;
            let connected = edges
                .iter()
                .any(|edge| edge.source == node.id || edge.target == node.id);
            if !connected {
                self.attempt_connect_orphan(index, node).await?;
            }
        }

        self.dedupe_edges(index).await?;
        Ok(())
    }

    /// Relation inference between a candidate and a newly created node;
    /// `SourceLabel::Node1` makes the candidate the edge source.
    async fn infer_and_connect(
        &self,
        index: &str,
        candidate: &Node,
        node: &Node,
    ) -> Result<bool, IngestError> {
        let judgement = self
            .semantic
            .infer_relation(&candidate.embed_text(), &node.embed_text())
            .await?;
        if !judgement.related {
            return Ok(false);
        }

        let (source, target) = match judgement.source {
            SourceLabel::Node1 => (candidate.id.clone(), node.id.clone()),
            SourceLabel::Node2 => (node.id.clone(), candidate.id.clone()),
        };
        if self
            .repo
            .get_edge_between(index, &source, &target)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        self.insert_edge_dropping_integrity(&Edge::new(
            index,
            source,
            target,
            judgement.relationship,
        ))
        .await
    }

    /// Connects a node that ended extraction without an incident edge to its
    /// nearest vector neighbours, stopping after two insertions.
    pub async fn attempt_connect_orphan(
        &self,
        index: &str,
        orphan: &Node,
    ) -> Result<(), IngestError> {
        let mut candidates: Vec<String> = Vec::new();
        for hit in self
            .vector
            .search(
                index,
                &orphan.embed_text(),
                ORPHAN_DESC_LIMIT,
                ORPHAN_DESC_MIN_RELEVANCE,
            )
            .await?
        {
            if hit.id != orphan.id && !candidates.contains(&hit.id) {
                candidates.push(hit.id);
            }
        }
        if candidates.len() < ORPHAN_MIN_CANDIDATES {
            for hit in self
                .vector
                .search(
                    index,
                    &orphan.name,
                    ORPHAN_NAME_LIMIT,
                    ORPHAN_NAME_MIN_RELEVANCE,
                )
                .await?
            {
                if hit.id != orphan.id && !candidates.contains(&hit.id) {
                    candidates.push(hit.id);
                }
            }
        }

        candidates.truncate(ORPHAN_RESOLVE_LIMIT);
        let resolved = self.repo.get_nodes_by_ids(&candidates).await?;

        let mut inserted = 0;
        for candidate in resolved.into_iter().take(ORPHAN_INFER_LIMIT) {
            if self.infer_and_connect(index, &candidate, orphan).await? {
                inserted += 1;
                if inserted >= ORPHAN_MAX_EDGES {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Collapses duplicate undirected edges: the first-seen edge of each
    /// pair survives, extra relationships are merged into it.
    async fn dedupe_edges(&self, index: &str) -> Result<(), IngestError> {
        let edges = self.repo.get_edges(index).await?;

        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<Edge>> = HashMap::new();
        for edge in edges {
            let key = if edge.source <= edge.target {
                (edge.source.clone(), edge.target.clone())
            } else {
                (edge.target.clone(), edge.source.clone())
            };
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(edge);
        }

        for key in order {
            let group = groups.remove(&key).unwrap_or_default();
            if group.len() < 2 {
                continue;
            }
            let mut iter = group.into_iter();
            let mut primary = match iter.next() {
                Some(edge) => edge,
                None => continue,
            };
            for extra in iter {
                if extra.relationship != primary.relationship {
                    let merged = self
                        .merge_with_fallback(&primary.relationship, &extra.relationship)
                        .await?;
                    self.repo
                        .update_edge_relationship(index, &primary.id, &merged)
                        .await?;
                    primary.relationship = merged;
                }
                self.repo.delete_edge(index, &extra.id).await?;
            }
        }
        Ok(())
    }

    /// Model-assisted merge; an empty model answer falls back to a `"; "`
    /// concatenation so a merge always makes progress.
    async fn merge_with_fallback(&self, a: &str, b: &str) -> Result<String, IngestError> {
        let merged = self.semantic.merge_descriptions(a, b).await?;
        if merged.trim().is_empty() {
            Ok(format!("{a}; {b}"))
        } else {
            Ok(merged)
        }
    }

    async fn insert_edge_dropping_integrity(&self, edge: &Edge) -> Result<bool, IngestError> {
        match self.repo.insert_edge(edge).await {
            Ok(()) => Ok(true),
            Err(RepoError::Integrity(reason)) => {
                warn!(edge = %edge.id, %reason, "dropping edge rejected by repository");
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }
}

fn validate(index: &str, text: &str) -> Result<(), IngestError> {
    if index.trim().is_empty() {
        return Err(IngestError::InvalidInput("index must not be empty".into()));
    }
    if text.trim().is_empty() {
        return Err(IngestError::InvalidInput("text must not be empty".into()));
    }
    Ok(())
}
