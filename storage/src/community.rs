use graphmind_core::model::{Edge, Node};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Fast label propagation over the undirected view of the graph.
///
/// Every node starts with its own id as label; nodes repeatedly adopt the
/// most frequent label among their neighbours (ties broken by smallest label
/// string), re-activating disagreeing neighbours, until the active queue
/// drains or the iteration cap is hit. Isolated nodes keep their own id and
/// are omitted from the result, so they never form communities.
pub struct CommunityDetector {
    iteration_cap: usize,
}

impl CommunityDetector {
    pub fn new(iteration_cap: usize) -> Self {
        Self { iteration_cap }
    }

    /// Label map for every non-isolated node. The same graph always yields
    /// the same map: neighbour order, queue order, and tie-breaks are fixed.
    pub fn detect(&self, nodes: &[Node], edges: &[Edge]) -> BTreeMap<String, String> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut linked: HashSet<(&str, &str)> = HashSet::new();
        for node in nodes {
            adjacency.entry(node.id.as_str()).or_default();
        }
        for edge in edges {
            let (source, target) = (edge.source.as_str(), edge.target.as_str());
            if source == target {
                continue;
            }
            let pair = if source < target {
                (source, target)
            } else {
                (target, source)
            };
            if !linked.insert(pair) {
                continue;
            }
            adjacency.entry(source).or_default().push(target);
            adjacency.entry(target).or_default().push(source);
        }

        let mut labels: HashMap<&str, String> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut queued: HashSet<&str> = HashSet::new();
        for node in nodes {
            let id = node.id.as_str();
            labels.insert(id, id.to_string());
            let degree = adjacency.get(id).map(Vec::len).unwrap_or(0);
            if degree >= 1 && queued.insert(id) {
                queue.push_back(id);
            }
        }

        let mut iterations = 0usize;
        while let Some(current) = queue.pop_front() {
            queued.remove(current);
            iterations += 1;
            if iterations > self.iteration_cap {
                break;
            }

            let Some(neighbours) = adjacency.get(current) else {
                continue;
            };

            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for neighbour in neighbours {
                if let Some(label) = labels.get(neighbour) {
                    *counts.entry(label.as_str()).or_insert(0) += 1;
                }
            }
            // BTreeMap iterates labels in ascending order, so the first
            // maximum is the smallest label string among the tied ones.
            let Some(best) = counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(label, _)| label.to_string())
            else {
                continue;
            };

            if labels.get(current) == Some(&best) {
                continue;
            }
            labels.insert(current, best.clone());

            for neighbour in neighbours {
                if labels.get(neighbour) != Some(&best) && queued.insert(*neighbour) {
                    queue.push_back(*neighbour);
                }
            }
        }

        let mut out = BTreeMap::new();
        for node in nodes {
            let id = node.id.as_str();
            if adjacency.get(id).map(Vec::len).unwrap_or(0) >= 1 {
                out.insert(id.to_string(), labels[id].clone());
            }
        }
        out
    }
}

impl Default for CommunityDetector {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(names: &[&str]) -> Vec<Node> {
        names
            .iter()
            .map(|name| Node {
                id: format!("n-{name}"),
                index: "idx".into(),
                name: (*name).into(),
                kind: "Thing".into(),
                desc: String::new(),
            })
            .collect()
    }

    fn edge(a: &str, b: &str) -> Edge {
        Edge::new("idx", format!("n-{a}"), format!("n-{b}"), "links")
    }

    #[test]
    fn two_cliques_get_two_labels() {
        let nodes = fixture(&["a", "b", "c", "x", "y", "z"]);
        let edges = vec![
            edge("a", "b"),
            edge("b", "c"),
            edge("a", "c"),
            edge("x", "y"),
            edge("y", "z"),
            edge("x", "z"),
        ];

        let labels = CommunityDetector::default().detect(&nodes, &edges);

        assert_eq!(labels.len(), 6);
        assert_eq!(labels["n-a"], labels["n-b"]);
        assert_eq!(labels["n-b"], labels["n-c"]);
        assert_eq!(labels["n-x"], labels["n-y"]);
        assert_eq!(labels["n-y"], labels["n-z"]);
        assert_ne!(labels["n-a"], labels["n-x"]);
    }

    #[test]
    fn isolated_nodes_are_omitted() {
        let nodes = fixture(&["a", "b", "lonely"]);
        let edges = vec![edge("a", "b")];

        let labels = CommunityDetector::default().detect(&nodes, &edges);

        assert!(labels.contains_key("n-a"));
        assert!(labels.contains_key("n-b"));
        assert!(!labels.contains_key("n-lonely"));
    }

    #[test]
    fn self_loops_and_duplicate_edges_are_ignored() {
        let nodes = fixture(&["a", "b"]);
        let edges = vec![edge("a", "a"), edge("a", "b"), edge("b", "a")];

        let labels = CommunityDetector::default().detect(&nodes, &edges);

        assert_eq!(labels.len(), 2);
        assert_eq!(labels["n-a"], labels["n-b"]);
    }

    #[test]
    fn detection_is_deterministic() {
        let nodes = fixture(&["a", "b", "c", "d", "e", "f", "g"]);
        let edges = vec![
            edge("a", "b"),
            edge("b", "c"),
            edge("c", "d"),
            edge("e", "f"),
            edge("f", "g"),
            edge("a", "c"),
        ];

        let detector = CommunityDetector::default();
        let first = detector.detect(&nodes, &edges);
        let second = detector.detect(&nodes, &edges);
        assert_eq!(first, second);
    }
}
