use std::sync::Arc;

use graphmind_core::config::SearchConfig;
use graphmind_core::semantic::{
    ExtractedEdge, ExtractedNode, GraphExtraction, MockSemanticClient,
};
use ingestion::GraphIngestor;
use query::GraphEngine;
use storage::repo::GraphRepository;
use storage::{InMemoryRepository, InMemoryVectorMemory};

#[tokio::test]
async fn ingest_summarize_and_search_end_to_end() {
    let repo = Arc::new(InMemoryRepository::new());
    let vector = Arc::new(InMemoryVectorMemory::new());
    let semantic = Arc::new(MockSemanticClient::new());

    let ingestor = GraphIngestor::new(repo.clone(), vector.clone(), semantic.clone());
    let engine = GraphEngine::new(
        repo.clone(),
        vector.clone(),
        semantic.clone(),
        SearchConfig::default(),
    );

    semantic.push_extraction(GraphExtraction {
        nodes: vec![
            ExtractedNode::new("1", "Toyota", "Company", "makes electric cars"),
            ExtractedNode::new("2", "Battery Tech", "Technology", "stores energy"),
        ],
        edges: vec![ExtractedEdge::new("1", "2", "depends on")],
    });
    semantic.push_extraction(GraphExtraction {
        nodes: vec![
            ExtractedNode::new("1", "Toyota", "Company", "expands production"),
            ExtractedNode::new("2", "Panasonic", "Company", "supplies batteries"),
        ],
        edges: vec![ExtractedEdge::new("2", "1", "supplies")],
    });

    ingestor
        .insert_graph_data("auto", "Toyota makes electric cars with battery tech.")
        .await
        .unwrap();
    ingestor
        .insert_graph_data("auto", "Toyota expands production, supplied by Panasonic.")
        .await
        .unwrap();

    // Second chunk merged into the same Toyota node.
    let nodes = repo.get_nodes("auto").await.unwrap();
    assert_eq!(nodes.len(), 3);
    let toyota = nodes.iter().find(|n| n.name == "Toyota").unwrap();
    assert!(toyota.desc.contains("electric cars"));
    assert!(toyota.desc.contains("expands production"));

    let edges = repo.get_edges("auto").await.unwrap();
    assert_eq!(edges.len(), 2);

    engine.rebuild_communities("auto").await.unwrap();
    engine.rebuild_global("auto").await.unwrap();

    let memberships = repo.get_memberships("auto").await.unwrap();
    assert_eq!(memberships.len(), 3, "the graph is one connected component");
    assert_eq!(repo.get_communities("auto").await.unwrap().len(), 1);
    assert!(repo.get_global("auto").await.unwrap().is_some());

    semantic.set_answer("Toyota leads EV production.");
    let answer = engine
        .search_graph("auto", "toyota electric cars company")
        .await
        .unwrap();
    assert_eq!(answer, "Toyota leads EV production.");

    let context = semantic.last_context().unwrap();
    assert!(context.contains("Toyota"));
    assert!(context.contains("Panasonic"), "expansion reaches the supplier");

    engine.delete_index("auto").await.unwrap();
    assert!(repo.get_nodes("auto").await.unwrap().is_empty());
    assert_eq!(vector.count("auto"), 0);
}
