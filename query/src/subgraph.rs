use graphmind_core::model::{Edge, Node};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// The query-relevant portion of a graph; serialized as-is into the context
/// JSON handed to the language model.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QuerySubgraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Fixed overhead of the surrounding prompt scaffolding.
const BASE_TOKENS: usize = 200;
/// Per-node structural overhead beyond its text fields.
const NODE_OVERHEAD_TOKENS: usize = 15;
const EDGE_TOKENS: usize = 10;
/// Fraction of the budget the greedy selection may fill; the slack absorbs
/// estimator drift.
const BUDGET_FILL_NUM: usize = 9;
const BUDGET_FILL_DEN: usize = 10;

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

/// CJK code points count as a full token, everything else as three quarters.
/// A proxy, not a tokenizer.
fn desc_token_estimate(desc: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for ch in desc.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + (other * 3) / 4
}

pub fn node_token_cost(node: &Node) -> usize {
    desc_token_estimate(&node.desc)
        + node.id.chars().count() / 3
        + node.name.chars().count() / 3
        + NODE_OVERHEAD_TOKENS
}

pub fn estimate_tokens(graph: &QuerySubgraph) -> usize {
    BASE_TOKENS
        + graph.nodes.iter().map(node_token_cost).sum::<usize>()
        + EDGE_TOKENS * graph.edges.len()
}

fn weight_of(weights: &HashMap<String, f32>, id: &str) -> f32 {
    weights.get(id).copied().unwrap_or(0.0)
}

/// Shrinks an over-budget subgraph: nodes are taken greedily by descending
/// weight while the running estimate stays within 90% of `max_tokens`, then
/// edges with a dropped endpoint are dropped too. A graph already within
/// budget passes through untouched.
pub fn truncate_to_budget(
    graph: QuerySubgraph,
    weights: &HashMap<String, f32>,
    max_tokens: usize,
) -> QuerySubgraph {
    if estimate_tokens(&graph) <= max_tokens {
        return graph;
    }

    let limit = max_tokens * BUDGET_FILL_NUM / BUDGET_FILL_DEN;
    let QuerySubgraph { mut nodes, edges } = graph;

    nodes.sort_by(|a, b| {
        weight_of(weights, &b.id)
            .partial_cmp(&weight_of(weights, &a.id))
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let mut kept = Vec::new();
    let mut running = BASE_TOKENS;
    for node in nodes {
        let cost = node_token_cost(&node);
        if running + cost > limit {
            break;
        }
        running += cost;
        kept.push(node);
    }

    let kept_ids: HashSet<&str> = kept.iter().map(|node| node.id.as_str()).collect();
    let edges = edges
        .into_iter()
        .filter(|edge| {
            kept_ids.contains(edge.source.as_str()) && kept_ids.contains(edge.target.as_str())
        })
        .collect();

    QuerySubgraph { nodes: kept, edges }
}
