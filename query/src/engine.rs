use crate::subgraph::{truncate_to_budget, QuerySubgraph};
use futures::stream::StreamExt;
use graphmind_core::config::SearchConfig;
use graphmind_core::model::{Community, CommunityMembership, Edge, GlobalSummary, Node};
use graphmind_core::semantic::{AnswerStream, SemanticClient, SemanticError};
use graphmind_core::vector::{VectorError, VectorHit, VectorMemory};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use storage::community::CommunityDetector;
use storage::repo::{GraphRepository, RepoError};
use thiserror::Error;
use tracing::{debug, warn};

/// Frontier nodes explored per expansion step.
const FRONTIER_LIMIT: usize = 5;
/// Retrieval widening: floor, threshold step and extra hits for the rerun.
const WIDEN_FLOOR: f32 = 0.3;
const WIDEN_STEP: f32 = 0.2;
const WIDEN_EXTRA_LIMIT: usize = 2;
/// Weight assigned to nodes discovered by expansion rather than retrieval,
/// relative to the best weight seen so far.
const DISCOVERED_WEIGHT_FACTOR: f32 = 0.8;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Semantic(#[from] SemanticError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphViewNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub desc: String,
    pub color: String,
}

/// Visualization shape: full graph with one colour per node type, stable
/// within the response.
#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphViewNode>,
    pub edges: Vec<Edge>,
}

const KIND_PALETTE: [&str; 10] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
    "#9c755f", "#bab0ac",
];

/// Query-side orchestration: vector retrieval, weighted recursive subgraph
/// expansion, token-budgeted truncation, answer composition, community and
/// global summarization, index deletion.
pub struct GraphEngine {
    repo: Arc<dyn GraphRepository>,
    vector: Arc<dyn VectorMemory>,
    semantic: Arc<dyn SemanticClient>,
    search: SearchConfig,
}

impl GraphEngine {
    pub fn new(
        repo: Arc<dyn GraphRepository>,
        vector: Arc<dyn VectorMemory>,
        semantic: Arc<dyn SemanticClient>,
        search: SearchConfig,
    ) -> Self {
        Self {
            repo,
            vector,
            semantic,
            search,
        }
    }

    pub async fn list_indices(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.repo.list_indices().await?)
    }

    /// Vector retrieval with one widening rerun: when the configured
    /// threshold yields fewer than two hits, retry 0.2 lower (floor 0.3)
    /// with a slightly larger limit, merging by id, first seen wins.
    pub async fn retrieve_relevant(
        &self,
        index: &str,
        query: &str,
    ) -> Result<Vec<VectorHit>, QueryError> {
        let mut hits = self
            .vector
            .search(
                index,
                query,
                self.search.search_limit,
                self.search.search_min_relevance,
            )
            .await?;

        if hits.len() < 2 && self.search.search_min_relevance > WIDEN_FLOOR {
            let relaxed = (self.search.search_min_relevance - WIDEN_STEP).max(WIDEN_FLOOR);
            let more = self
                .vector
                .search(
                    index,
                    query,
                    self.search.search_limit + WIDEN_EXTRA_LIMIT,
                    relaxed,
                )
                .await?;
            for hit in more {
                if !hits.iter().any(|existing| existing.id == hit.id) {
                    hits.push(hit);
                }
            }
        }

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    /// Bounded BFS from the seeds. Each step explores the five heaviest
    /// frontier nodes, pulls edges incident to the collected node set, and
    /// admits new endpoints with a weight of 0.8 times the best weight seen.
    /// Stops on depth, node count, or a dry step; overflow keeps the
    /// heaviest nodes and drops edges with a dropped endpoint.
    pub async fn build_recursive_subgraph(
        &self,
        index: &str,
        seeds: Vec<Node>,
        weights: &mut HashMap<String, f32>,
    ) -> Result<QuerySubgraph, QueryError> {
        let mut node_ids: HashSet<String> = seeds.iter().map(|node| node.id.clone()).collect();
        let mut nodes = seeds.clone();
        let mut edges: Vec<Edge> = Vec::new();
        let mut edge_pairs: HashSet<(String, String)> = HashSet::new();
        let mut frontier = seeds;
        let mut depth = 0usize;

        while depth < self.search.node_depth
            && nodes.len() < self.search.max_nodes
            && !frontier.is_empty()
        {
            frontier.sort_by(|a, b| {
                weight_of(weights, &b.id)
                    .partial_cmp(&weight_of(weights, &a.id))
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
            frontier.truncate(FRONTIER_LIMIT);

            let candidate_ids: Vec<String> = node_ids.iter().cloned().collect();
            let round_edges = self
                .repo
                .get_edges_by_node_ids(index, &candidate_ids)
                .await?;

            let mut new_ids: Vec<String> = Vec::new();
            for edge in round_edges {
                for endpoint in [&edge.source, &edge.target] {
                    if !node_ids.contains(endpoint) && !new_ids.contains(endpoint) {
                        new_ids.push(endpoint.clone());
                    }
                }
                let key = undirected_key(&edge.source, &edge.target);
                if edge_pairs.insert(key) {
                    edges.push(edge);
                }
            }

            if new_ids.is_empty() {
                break;
            }

            let discovered = self.repo.get_nodes_by_ids(&new_ids).await?;
            let best_weight = weights.values().fold(0.0f32, |acc, w| acc.max(*w));
            let default_weight = DISCOVERED_WEIGHT_FACTOR * best_weight;
            for node in &discovered {
                weights.entry(node.id.clone()).or_insert(default_weight);
                node_ids.insert(node.id.clone());
            }
            nodes.extend(discovered.iter().cloned());
            frontier = discovered;
            depth += 1;
        }

        if nodes.len() > self.search.max_nodes {
            nodes.sort_by(|a, b| {
                weight_of(weights, &b.id)
                    .partial_cmp(&weight_of(weights, &a.id))
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
            nodes.truncate(self.search.max_nodes);
            node_ids = nodes.iter().map(|node| node.id.clone()).collect();
        }
        edges.retain(|edge| node_ids.contains(&edge.source) && node_ids.contains(&edge.target));

        Ok(QuerySubgraph { nodes, edges })
    }

    async fn assemble_subgraph(
        &self,
        index: &str,
        query: &str,
    ) -> Result<QuerySubgraph, QueryError> {
        let hits = self.retrieve_relevant(index, query).await?;
        let seed_ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let seeds = self.repo.get_nodes_by_ids(&seed_ids).await?;

        let mut weights: HashMap<String, f32> = hits
            .into_iter()
            .map(|hit| (hit.id, hit.relevance))
            .collect();

        let graph = self
            .build_recursive_subgraph(index, seeds, &mut weights)
            .await?;
        Ok(truncate_to_budget(graph, &weights, self.search.max_tokens))
    }

    /// Answers `query` over the assembled subgraph. An empty subgraph gives
    /// an empty answer without touching the model.
    pub async fn search_graph(&self, index: &str, query: &str) -> Result<String, QueryError> {
        validate(index, query)?;

        let graph = self.assemble_subgraph(index, query).await?;
        if graph.nodes.is_empty() {
            debug!(index, "subgraph is empty, skipping answer");
            return Ok(String::new());
        }

        let context = serde_json::to_string(&graph)?;
        Ok(self.semantic.answer(&context, query).await?)
    }

    /// Streaming variant: an empty subgraph yields an empty stream, never a
    /// model call. Dropping the stream cancels the underlying one.
    pub async fn search_graph_stream(
        &self,
        index: &str,
        query: &str,
    ) -> Result<AnswerStream, QueryError> {
        validate(index, query)?;

        let graph = self.assemble_subgraph(index, query).await?;
        if graph.nodes.is_empty() {
            return Ok(futures::stream::empty::<Result<String, SemanticError>>().boxed());
        }

        let context = serde_json::to_string(&graph)?;
        Ok(self.semantic.answer_stream(&context, query).await?)
    }

    /// Like `search_graph`, with the subgraph's community summaries and the
    /// index's global summary folded into the model context.
    pub async fn search_graph_community(
        &self,
        index: &str,
        query: &str,
    ) -> Result<String, QueryError> {
        validate(index, query)?;

        let graph = self.assemble_subgraph(index, query).await?;
        if graph.nodes.is_empty() {
            return Ok(String::new());
        }

        let node_ids: HashSet<&str> = graph.nodes.iter().map(|node| node.id.as_str()).collect();
        let memberships = self.repo.get_memberships(index).await?;
        let mut relevant: Vec<&str> = Vec::new();
        for membership in &memberships {
            if node_ids.contains(membership.node_id.as_str())
                && !relevant.contains(&membership.community_id.as_str())
            {
                relevant.push(&membership.community_id);
            }
        }

        let communities = self.repo.get_communities(index).await?;
        let summaries: Vec<&str> = communities
            .iter()
            .filter(|community| relevant.contains(&community.community_id.as_str()))
            .map(|community| community.summaries.as_str())
            .collect();
        let global = self.repo.get_global(index).await?;

        let context = serde_json::json!({
            "nodes": graph.nodes,
            "edges": graph.edges,
            "communities": summaries,
            "global": global.map(|g| g.summaries).unwrap_or_default(),
        });
        Ok(self.semantic.answer(&context.to_string(), query).await?)
    }

    /// Wipes and regenerates community memberships and summaries for
    /// `index`. Community ids are labels from the latest propagation run and
    /// must not be persisted across rebuilds.
    pub async fn rebuild_communities(&self, index: &str) -> Result<(), QueryError> {
        validate_index(index)?;

        let nodes = self.repo.get_nodes(index).await?;
        let edges = self.repo.get_edges(index).await?;
        let labels = CommunityDetector::default().detect(&nodes, &edges);

        let memberships: Vec<CommunityMembership> = labels
            .iter()
            .map(|(node_id, community_id)| CommunityMembership {
                index: index.to_string(),
                community_id: community_id.clone(),
                node_id: node_id.clone(),
            })
            .collect();
        self.repo.replace_communities(index, &memberships).await?;

        let mut members_by_community: BTreeMap<&str, Vec<&Node>> = BTreeMap::new();
        for node in &nodes {
            if let Some(label) = labels.get(&node.id) {
                members_by_community
                    .entry(label.as_str())
                    .or_default()
                    .push(node);
            }
        }

        for (community_id, members) in members_by_community {
            let member_block = members
                .iter()
                .map(|node| {
                    format!(
                        "Name:{}; Type:{}; Desc:{}",
                        node.name, node.kind, node.desc
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let summary = self.semantic.summarize_community(&member_block).await?;
            self.repo
                .upsert_community_summary(&Community {
                    community_id: community_id.to_string(),
                    index: index.to_string(),
                    summaries: summary,
                })
                .await?;
        }
        Ok(())
    }

    /// Regenerates the single global summary from the current community
    /// summaries. A summary-less index is left untouched.
    pub async fn rebuild_global(&self, index: &str) -> Result<(), QueryError> {
        validate_index(index)?;

        let communities = self.repo.get_communities(index).await?;
        if communities.is_empty() {
            debug!(index, "no community summaries, skipping global rebuild");
            return Ok(());
        }

        let block = communities
            .iter()
            .map(|community| community.summaries.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let summary = self.semantic.summarize_global(&block).await?;
        self.repo
            .upsert_global(&GlobalSummary {
                index: index.to_string(),
                summaries: summary,
            })
            .await?;
        Ok(())
    }

    /// Removes every trace of `index`: vector entries first, then the
    /// persisted rows in referential order.
    pub async fn delete_index(&self, index: &str) -> Result<(), QueryError> {
        validate_index(index)?;

        let nodes = self.repo.get_nodes(index).await?;
        for node in &nodes {
            if let Err(err) = self.vector.remove(index, &node.id).await {
                warn!(index, node = %node.id, error = %err, "vector entry removal failed");
            }
        }
        self.repo.delete_index_data(index).await?;
        Ok(())
    }

    /// Full graph of `index` for visualization, one colour per node type.
    pub async fn get_graph(&self, index: &str) -> Result<GraphView, QueryError> {
        validate_index(index)?;

        let nodes = self.repo.get_nodes(index).await?;
        let edges = self.repo.get_edges(index).await?;

        let mut colors: HashMap<String, &str> = HashMap::new();
        let view_nodes = nodes
            .into_iter()
            .map(|node| {
                let next = KIND_PALETTE[colors.len() % KIND_PALETTE.len()];
                let color = *colors.entry(node.kind.clone()).or_insert(next);
                GraphViewNode {
                    id: node.id,
                    name: node.name,
                    kind: node.kind,
                    desc: node.desc,
                    color: color.to_string(),
                }
            })
            .collect();

        Ok(GraphView {
            nodes: view_nodes,
            edges,
        })
    }
}

fn weight_of(weights: &HashMap<String, f32>, id: &str) -> f32 {
    weights.get(id).copied().unwrap_or(0.0)
}

fn undirected_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn validate_index(index: &str) -> Result<(), QueryError> {
    if index.trim().is_empty() {
        return Err(QueryError::InvalidInput("index must not be empty".into()));
    }
    Ok(())
}

fn validate(index: &str, query: &str) -> Result<(), QueryError> {
    validate_index(index)?;
    if query.trim().is_empty() {
        return Err(QueryError::InvalidInput("query must not be empty".into()));
    }
    Ok(())
}
