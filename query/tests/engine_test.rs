use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use graphmind_core::config::SearchConfig;
use graphmind_core::model::{Edge, Node};
use graphmind_core::semantic::MockSemanticClient;
use graphmind_core::vector::VectorMemory;
use query::engine::QueryError;
use query::{estimate_tokens, GraphEngine};
use storage::repo::GraphRepository;
use storage::{InMemoryRepository, InMemoryVectorMemory};

struct Harness {
    repo: Arc<InMemoryRepository>,
    vector: Arc<InMemoryVectorMemory>,
    semantic: Arc<MockSemanticClient>,
    engine: GraphEngine,
}

fn harness_with(search: SearchConfig) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let vector = Arc::new(InMemoryVectorMemory::new());
    let semantic = Arc::new(MockSemanticClient::new());
    let engine = GraphEngine::new(repo.clone(), vector.clone(), semantic.clone(), search);
    Harness {
        repo,
        vector,
        semantic,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(SearchConfig::default())
}

fn node_with_id(id: &str, index: &str, name: &str, kind: &str, desc: &str) -> Node {
    Node {
        id: id.to_string(),
        index: index.to_string(),
        name: name.to_string(),
        kind: kind.to_string(),
        desc: desc.to_string(),
    }
}

/// Two connected nodes with a vector entry for the first one.
async fn seed_small_graph(h: &Harness) -> (Node, Node) {
    let toyota = Node::new("auto", "Toyota", "Company", "makes electric cars");
    let battery = Node::new("auto", "Battery", "Technology", "stores energy for vehicles");
    h.repo.insert_node(&toyota).await.unwrap();
    h.repo.insert_node(&battery).await.unwrap();
    h.repo
        .insert_edge(&Edge::new(
            "auto",
            toyota.id.clone(),
            battery.id.clone(),
            "depends on",
        ))
        .await
        .unwrap();
    h.vector
        .save("auto", &toyota.id, &toyota.embed_text())
        .await
        .unwrap();
    h.vector
        .save("auto", &battery.id, &battery.embed_text())
        .await
        .unwrap();
    (toyota, battery)
}

#[tokio::test]
async fn empty_index_search_returns_empty_without_a_model_call() {
    let h = harness();

    let answer = h.engine.search_graph("empty", "hi").await.unwrap();

    assert_eq!(answer, "");
    assert_eq!(h.semantic.answer_calls(), 0);
}

#[tokio::test]
async fn blank_inputs_are_rejected() {
    let h = harness();

    assert!(matches!(
        h.engine.search_graph("", "hi").await,
        Err(QueryError::InvalidInput(_))
    ));
    assert!(matches!(
        h.engine.search_graph("idx", " ").await,
        Err(QueryError::InvalidInput(_))
    ));
    assert!(matches!(
        h.engine.delete_index("").await,
        Err(QueryError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn search_expands_the_seed_into_its_neighbourhood() {
    let h = harness();
    let (_toyota, _battery) = seed_small_graph(&h).await;
    h.semantic.set_answer("EV production is growing");

    let answer = h
        .engine
        .search_graph("auto", "toyota electric cars company")
        .await
        .unwrap();

    assert_eq!(answer, "EV production is growing");
    let context = h.semantic.last_context().unwrap();
    assert!(context.contains("Toyota"));
    assert!(context.contains("Battery"), "expansion should pull the neighbour");
}

#[tokio::test]
async fn retrieval_widens_the_threshold_when_hits_are_scarce() {
    let h = harness();
    let node = Node::new(
        "idx",
        "Thing",
        "Kind",
        "alpha beta gamma delta epsilon zeta eta theta iota",
    );
    h.repo.insert_node(&node).await.unwrap();
    h.vector
        .save("idx", &node.id, &node.embed_text())
        .await
        .unwrap();

    // Overlap sits between the widened floor (0.3) and the configured
    // threshold (0.5), so only the rerun finds it.
    let hits = h
        .engine
        .retrieve_relevant("idx", "alpha beta gamma delta epsilon")
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, node.id);
    assert!(hits[0].relevance < 0.5);
}

#[tokio::test]
async fn subgraph_respects_node_and_depth_bounds() {
    let h = harness_with(SearchConfig {
        search_limit: 5,
        search_min_relevance: 0.5,
        node_depth: 3,
        max_nodes: 10,
        max_tokens: 100_000,
    });

    // 50 nodes, 200 undirected edges: a ring plus three chord families.
    let nodes: Vec<Node> = (0..50)
        .map(|i| node_with_id(&format!("n{i:02}"), "big", &format!("node {i}"), "T", "desc"))
        .collect();
    for node in &nodes {
        h.repo.insert_node(node).await.unwrap();
    }
    for i in 0..50usize {
        for k in [1usize, 7, 13, 19] {
            let edge = Edge::new(
                "big",
                format!("n{i:02}"),
                format!("n{:02}", (i + k) % 50),
                "links",
            );
            h.repo.insert_edge(&edge).await.unwrap();
        }
    }

    let seeds = vec![nodes[0].clone(), nodes[20].clone(), nodes[40].clone()];
    let mut weights: HashMap<String, f32> = HashMap::from([
        ("n00".to_string(), 1.0),
        ("n20".to_string(), 0.9),
        ("n40".to_string(), 0.8),
    ]);

    let graph = h
        .engine
        .build_recursive_subgraph("big", seeds, &mut weights)
        .await
        .unwrap();

    assert!(graph.nodes.len() <= 10, "got {} nodes", graph.nodes.len());
    let kept: Vec<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &graph.edges {
        assert!(kept.contains(&edge.source.as_str()));
        assert!(kept.contains(&edge.target.as_str()));
    }
    assert!(estimate_tokens(&graph) <= 100_000);
}

#[tokio::test]
async fn rebuild_communities_covers_every_connected_node_once() {
    let h = harness();

    let names = ["a", "b", "c", "x", "y", "z", "lonely"];
    let nodes: Vec<Node> = names
        .iter()
        .map(|name| node_with_id(&format!("n-{name}"), "idx", name, "T", "desc"))
        .collect();
    for node in &nodes {
        h.repo.insert_node(node).await.unwrap();
    }
    for (a, b) in [("a", "b"), ("b", "c"), ("a", "c"), ("x", "y"), ("y", "z"), ("x", "z")] {
        h.repo
            .insert_edge(&Edge::new("idx", format!("n-{a}"), format!("n-{b}"), "links"))
            .await
            .unwrap();
    }

    h.engine.rebuild_communities("idx").await.unwrap();

    let memberships = h.repo.get_memberships("idx").await.unwrap();
    assert_eq!(memberships.len(), 6, "isolated node gets no membership");
    let mut seen = std::collections::HashSet::new();
    for membership in &memberships {
        assert!(seen.insert(membership.node_id.clone()), "one membership per node");
        assert_ne!(membership.node_id, "n-lonely");
    }

    let communities = h.repo.get_communities("idx").await.unwrap();
    let referenced: std::collections::HashSet<&str> = memberships
        .iter()
        .map(|m| m.community_id.as_str())
        .collect();
    assert_eq!(communities.len(), referenced.len());
    assert_eq!(communities.len(), 2);
    for community in &communities {
        assert!(!community.summaries.is_empty());
    }
}

#[tokio::test]
async fn rebuild_global_upserts_one_summary_per_index() {
    let h = harness();
    let (_, _) = seed_small_graph(&h).await;

    // No communities yet: nothing to summarize.
    h.engine.rebuild_global("auto").await.unwrap();
    assert!(h.repo.get_global("auto").await.unwrap().is_none());

    h.engine.rebuild_communities("auto").await.unwrap();
    h.engine.rebuild_global("auto").await.unwrap();
    let global = h.repo.get_global("auto").await.unwrap().unwrap();
    assert!(global.summaries.contains("1"));

    // Rebuilding again replaces rather than duplicates.
    h.engine.rebuild_global("auto").await.unwrap();
    assert!(h.repo.get_global("auto").await.unwrap().is_some());
}

#[tokio::test]
async fn community_search_folds_summaries_into_the_context() {
    let h = harness();
    seed_small_graph(&h).await;
    h.engine.rebuild_communities("auto").await.unwrap();
    h.engine.rebuild_global("auto").await.unwrap();
    h.semantic.set_answer("with community context");

    let answer = h
        .engine
        .search_graph_community("auto", "toyota electric cars company")
        .await
        .unwrap();

    assert_eq!(answer, "with community context");
    let context = h.semantic.last_context().unwrap();
    assert!(context.contains("communities"));
    assert!(context.contains("community of:"));
    assert!(context.contains("global over"));
}

#[tokio::test]
async fn streaming_search_forwards_fragments() {
    let h = harness();
    seed_small_graph(&h).await;
    h.semantic.set_answer("streamed answer text");

    let empty: Vec<String> = h
        .engine
        .search_graph_stream("vacant", "anything")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(empty.is_empty());

    let fragments: Vec<String> = h
        .engine
        .search_graph_stream("auto", "toyota electric cars company")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(fragments.concat(), "streamed answer text");
}

#[tokio::test]
async fn delete_index_clears_rows_and_vector_entries() {
    let h = harness();
    let (toyota, _) = seed_small_graph(&h).await;
    h.engine.rebuild_communities("auto").await.unwrap();
    h.engine.rebuild_global("auto").await.unwrap();
    assert!(h.vector.count("auto") > 0);

    h.engine.delete_index("auto").await.unwrap();

    assert!(h.repo.get_nodes("auto").await.unwrap().is_empty());
    assert!(h.repo.get_edges("auto").await.unwrap().is_empty());
    assert!(h.repo.get_communities("auto").await.unwrap().is_empty());
    assert!(h.repo.get_memberships("auto").await.unwrap().is_empty());
    assert!(h.repo.get_global("auto").await.unwrap().is_none());
    assert_eq!(h.vector.count("auto"), 0);
    assert!(h
        .repo
        .get_nodes_by_ids(&[toyota.id.clone()])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn graph_view_colours_are_stable_per_type() {
    let h = harness();
    for (id, name, kind) in [
        ("p1", "Alice", "Person"),
        ("c1", "Acme", "Company"),
        ("p2", "Bob", "Person"),
    ] {
        h.repo
            .insert_node(&node_with_id(id, "idx", name, kind, "desc"))
            .await
            .unwrap();
    }

    let view = h.engine.get_graph("idx").await.unwrap();

    assert_eq!(view.nodes.len(), 3);
    let colour_of = |id: &str| {
        view.nodes
            .iter()
            .find(|node| node.id == id)
            .unwrap()
            .color
            .clone()
    };
    assert_eq!(colour_of("p1"), colour_of("p2"));
    assert_ne!(colour_of("p1"), colour_of("c1"));
}

#[tokio::test]
async fn list_indices_reflects_stored_nodes() {
    let h = harness();
    seed_small_graph(&h).await;
    h.repo
        .insert_node(&node_with_id("m1", "media", "Paper", "Document", "desc"))
        .await
        .unwrap();

    let indices = h.engine.list_indices().await.unwrap();
    assert_eq!(indices, vec!["auto".to_string(), "media".to_string()]);
}
