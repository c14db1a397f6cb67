use crate::repo::{GraphRepository, RepoError};
use async_trait::async_trait;
use dashmap::DashMap;
use graphmind_core::model::{Community, CommunityMembership, Edge, GlobalSummary, Node};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local adapter backing tests and embedded runs. Records carry a
/// sequence number so reads come back in insertion order, which keeps
/// downstream community detection deterministic.
pub struct InMemoryRepository {
    seq: AtomicU64,
    nodes: DashMap<String, (u64, Node)>,
    edges: DashMap<String, (u64, Edge)>,
    memberships: DashMap<String, Vec<CommunityMembership>>,
    communities: DashMap<(String, String), Community>,
    globals: DashMap<String, GlobalSummary>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            nodes: DashMap::new(),
            edges: DashMap::new(),
            memberships: DashMap::new(),
            communities: DashMap::new(),
            globals: DashMap::new(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn node_in_index(&self, index: &str, id: &str) -> bool {
        self.nodes
            .get(id)
            .map(|entry| entry.value().1.index == index)
            .unwrap_or(false)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphRepository for InMemoryRepository {
    async fn insert_node(&self, node: &Node) -> Result<(), RepoError> {
        self.nodes
            .insert(node.id.clone(), (self.next_seq(), node.clone()));
        Ok(())
    }

    async fn update_node_desc(&self, index: &str, id: &str, desc: &str) -> Result<(), RepoError> {
        match self.nodes.get_mut(id) {
            Some(mut entry) if entry.value().1.index == index => {
                entry.value_mut().1.desc = desc.to_string();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("node {id} in {index}"))),
        }
    }

    async fn get_nodes(&self, index: &str) -> Result<Vec<Node>, RepoError> {
        let mut rows: Vec<(u64, Node)> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().1.index == index)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, node)| node).collect())
    }

    async fn get_nodes_by_ids(&self, ids: &[String]) -> Result<Vec<Node>, RepoError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|entry| entry.value().1.clone()))
            .collect())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepoError> {
        if edge.source == edge.target {
            return Err(RepoError::Integrity(format!(
                "self-loop on node {}",
                edge.source
            )));
        }
        if !self.node_in_index(&edge.index, &edge.source)
            || !self.node_in_index(&edge.index, &edge.target)
        {
            return Err(RepoError::Integrity(format!(
                "edge {} references a missing endpoint",
                edge.id
            )));
        }

        self.edges
            .insert(edge.id.clone(), (self.next_seq(), edge.clone()));
        Ok(())
    }

    async fn update_edge_relationship(
        &self,
        index: &str,
        id: &str,
        relationship: &str,
    ) -> Result<(), RepoError> {
        match self.edges.get_mut(id) {
            Some(mut entry) if entry.value().1.index == index => {
                entry.value_mut().1.relationship = relationship.to_string();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("edge {id} in {index}"))),
        }
    }

    async fn delete_edge(&self, index: &str, id: &str) -> Result<(), RepoError> {
        self.edges
            .remove_if(id, |_, (_, edge)| edge.index == index);
        Ok(())
    }

    async fn get_edges(&self, index: &str) -> Result<Vec<Edge>, RepoError> {
        let mut rows: Vec<(u64, Edge)> = self
            .edges
            .iter()
            .filter(|entry| entry.value().1.index == index)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, edge)| edge).collect())
    }

    async fn get_edge_between(
        &self,
        index: &str,
        a: &str,
        b: &str,
    ) -> Result<Option<Edge>, RepoError> {
        let mut best: Option<(u64, Edge)> = None;
        for entry in self.edges.iter() {
            let (seq, edge) = entry.value();
            if edge.index != index {
                continue;
            }
            let matches = (edge.source == a && edge.target == b)
                || (edge.source == b && edge.target == a);
            if matches && best.as_ref().map(|(s, _)| *seq < *s).unwrap_or(true) {
                best = Some((*seq, edge.clone()));
            }
        }
        Ok(best.map(|(_, edge)| edge))
    }

    async fn get_edges_by_node_ids(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<Vec<Edge>, RepoError> {
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let mut rows: Vec<(u64, Edge)> = self
            .edges
            .iter()
            .filter(|entry| {
                let edge = &entry.value().1;
                edge.index == index
                    && (wanted.contains(edge.source.as_str())
                        || wanted.contains(edge.target.as_str()))
            })
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, edge)| edge).collect())
    }

    async fn replace_communities(
        &self,
        index: &str,
        memberships: &[CommunityMembership],
    ) -> Result<(), RepoError> {
        self.communities.retain(|(idx, _), _| idx != index);
        self.memberships.insert(index.to_string(), memberships.to_vec());
        Ok(())
    }

    async fn upsert_community_summary(&self, community: &Community) -> Result<(), RepoError> {
        self.communities.insert(
            (community.index.clone(), community.community_id.clone()),
            community.clone(),
        );
        Ok(())
    }

    async fn get_communities(&self, index: &str) -> Result<Vec<Community>, RepoError> {
        let mut rows: Vec<Community> = self
            .communities
            .iter()
            .filter(|entry| entry.key().0 == index)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.community_id.cmp(&b.community_id));
        Ok(rows)
    }

    async fn get_memberships(&self, index: &str) -> Result<Vec<CommunityMembership>, RepoError> {
        Ok(self
            .memberships
            .get(index)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn upsert_global(&self, global: &GlobalSummary) -> Result<(), RepoError> {
        self.globals.insert(global.index.clone(), global.clone());
        Ok(())
    }

    async fn get_global(&self, index: &str) -> Result<Option<GlobalSummary>, RepoError> {
        Ok(self.globals.get(index).map(|entry| entry.value().clone()))
    }

    async fn list_indices(&self) -> Result<Vec<String>, RepoError> {
        let indices: BTreeSet<String> = self
            .nodes
            .iter()
            .map(|entry| entry.value().1.index.clone())
            .collect();
        Ok(indices.into_iter().collect())
    }

    async fn delete_index_data(&self, index: &str) -> Result<(), RepoError> {
        self.globals.remove(index);
        self.communities.retain(|(idx, _), _| idx != index);
        self.memberships.remove(index);
        self.edges.retain(|_, (_, edge)| edge.index != index);
        self.nodes.retain(|_, (_, node)| node.index != index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: &str, name: &str) -> Node {
        Node::new(index, name, "Thing", format!("{name} desc"))
    }

    #[tokio::test]
    async fn rejects_dangling_and_self_loop_edges() {
        let repo = InMemoryRepository::new();
        let a = node("idx", "a");
        repo.insert_node(&a).await.unwrap();

        let dangling = Edge::new("idx", a.id.clone(), "missing", "knows");
        assert!(matches!(
            repo.insert_edge(&dangling).await,
            Err(RepoError::Integrity(_))
        ));

        let self_loop = Edge::new("idx", a.id.clone(), a.id.clone(), "knows");
        assert!(matches!(
            repo.insert_edge(&self_loop).await,
            Err(RepoError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn edges_do_not_cross_indices() {
        let repo = InMemoryRepository::new();
        let a = node("one", "a");
        let b = node("two", "b");
        repo.insert_node(&a).await.unwrap();
        repo.insert_node(&b).await.unwrap();

        let cross = Edge::new("one", a.id.clone(), b.id.clone(), "knows");
        assert!(matches!(
            repo.insert_edge(&cross).await,
            Err(RepoError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn get_edge_between_is_undirected() {
        let repo = InMemoryRepository::new();
        let a = node("idx", "a");
        let b = node("idx", "b");
        repo.insert_node(&a).await.unwrap();
        repo.insert_node(&b).await.unwrap();
        repo.insert_edge(&Edge::new("idx", a.id.clone(), b.id.clone(), "knows"))
            .await
            .unwrap();

        assert!(repo
            .get_edge_between("idx", &b.id, &a.id)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .get_edge_between("idx", &a.id, "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reads_preserve_insertion_order() {
        let repo = InMemoryRepository::new();
        let names = ["c", "a", "b"];
        for name in names {
            repo.insert_node(&node("idx", name)).await.unwrap();
        }

        let read: Vec<String> = repo
            .get_nodes("idx")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(read, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn delete_index_data_wipes_every_table() {
        let repo = InMemoryRepository::new();
        let a = node("idx", "a");
        let b = node("idx", "b");
        repo.insert_node(&a).await.unwrap();
        repo.insert_node(&b).await.unwrap();
        repo.insert_edge(&Edge::new("idx", a.id.clone(), b.id.clone(), "knows"))
            .await
            .unwrap();
        repo.replace_communities(
            "idx",
            &[CommunityMembership {
                index: "idx".into(),
                community_id: "c1".into(),
                node_id: a.id.clone(),
            }],
        )
        .await
        .unwrap();
        repo.upsert_community_summary(&Community {
            community_id: "c1".into(),
            index: "idx".into(),
            summaries: "s".into(),
        })
        .await
        .unwrap();
        repo.upsert_global(&GlobalSummary {
            index: "idx".into(),
            summaries: "g".into(),
        })
        .await
        .unwrap();

        repo.delete_index_data("idx").await.unwrap();

        assert!(repo.get_nodes("idx").await.unwrap().is_empty());
        assert!(repo.get_edges("idx").await.unwrap().is_empty());
        assert!(repo.get_communities("idx").await.unwrap().is_empty());
        assert!(repo.get_memberships("idx").await.unwrap().is_empty());
        assert!(repo.get_global("idx").await.unwrap().is_none());
        assert!(repo.list_indices().await.unwrap().is_empty());
    }
}
