use crate::repo::{with_backoff, GraphRepository, RepoError};
use async_trait::async_trait;
use graphmind_core::model::{Community, CommunityMembership, Edge, GlobalSummary, Node};
use neo4rs::{query, ConfigBuilder, Graph};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::OnceCell;

/// Property-graph adapter over Neo4j. Nodes live under the `Node` label;
/// every relation is a single `RELATES_TO` type carrying `id`, `index`,
/// `relationship` and `reversed`. Edges are stored in lexicographic endpoint
/// order; `reversed` reconstructs the authored direction on read.
pub struct Neo4jRepository {
    graph: Graph,
    constraints: OnceCell<()>,
}

/// Deterministic, direction-normalized edge identity: the id hashes the
/// lexicographically ordered endpoints, the relationship and the index, so
/// re-inserting the same logical edge upserts instead of duplicating.
pub fn normalized_edge_id(
    index: &str,
    source: &str,
    target: &str,
    relationship: &str,
) -> (String, bool) {
    let reversed = source > target;
    let (a, b) = if reversed {
        (target, source)
    } else {
        (source, target)
    };

    let mut hasher = Sha256::new();
    hasher.update(a.as_bytes());
    hasher.update(b"|");
    hasher.update(b.as_bytes());
    hasher.update(b"|");
    hasher.update(relationship.as_bytes());
    hasher.update(b"|");
    hasher.update(index.as_bytes());
    (format!("{:x}", hasher.finalize()), reversed)
}

/// Union of `";"`-separated relationship labels, first-seen order, so a
/// merge never loses a label that was already stored.
pub fn merge_relation_labels(existing: &str, incoming: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for raw in existing.split(';').chain(incoming.split(';')) {
        let part = raw.trim();
        if !part.is_empty() && !parts.iter().any(|p| p == part) {
            parts.push(part.to_string());
        }
    }
    parts.join("; ")
}

fn bolt_err(err: neo4rs::Error) -> RepoError {
    RepoError::Backend(err.to_string())
}

fn is_transient(err: &RepoError) -> bool {
    match err {
        RepoError::Backend(message) => {
            let m = message.to_ascii_lowercase();
            m.contains("connection") || m.contains("io error") || m.contains("timeout")
        }
        _ => false,
    }
}

fn col<T: serde::de::DeserializeOwned>(row: &neo4rs::Row, key: &str) -> Result<T, RepoError> {
    row.get::<T>(key)
        .map_err(|e| RepoError::Backend(format!("column {key}: {e}")))
}

fn edge_from_row(row: &neo4rs::Row) -> Result<Edge, RepoError> {
    let sid: String = col(row, "sid")?;
    let tid: String = col(row, "tid")?;
    let reversed: bool = col(row, "reversed")?;
    let (source, target) = if reversed { (tid, sid) } else { (sid, tid) };
    Ok(Edge {
        id: col(row, "id")?,
        index: col(row, "idx")?,
        source,
        target,
        relationship: col(row, "relationship")?,
    })
}

fn node_from_row(row: &neo4rs::Row) -> Result<Node, RepoError> {
    Ok(Node {
        id: col(row, "id")?,
        index: col(row, "idx")?,
        name: col(row, "name")?,
        kind: col(row, "kind")?,
        desc: col(row, "desc")?,
    })
}

const EDGE_RETURN: &str =
    "RETURN r.id AS id, r.index AS idx, r.relationship AS relationship, r.reversed AS reversed, \
     startNode(r).id AS sid, endNode(r).id AS tid";

impl Neo4jRepository {
    pub async fn connect(
        uri: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, RepoError> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .build()
            .map_err(bolt_err)?;
        let graph = Graph::connect(config).await.map_err(bolt_err)?;
        Ok(Self {
            graph,
            constraints: OnceCell::new(),
        })
    }

    /// Exactly one initializer runs to completion before any operation
    /// proceeds; later callers await it.
    async fn ensure_constraints(&self) -> Result<(), RepoError> {
        self.constraints
            .get_or_try_init(|| async {
                self.graph
                    .run(query(
                        "CREATE CONSTRAINT graphmind_node_id IF NOT EXISTS \
                         FOR (n:Node) REQUIRE n.id IS UNIQUE",
                    ))
                    .await
                    .map_err(bolt_err)?;
                self.graph
                    .run(query(
                        "CREATE INDEX graphmind_node_index IF NOT EXISTS \
                         FOR (n:Node) ON (n.index)",
                    ))
                    .await
                    .map_err(bolt_err)?;
                tracing::debug!("neo4j constraints ready");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn fetch_edges(&self, cypher: String, params: Vec<(&str, String)>) -> Result<Vec<Edge>, RepoError> {
        self.ensure_constraints().await?;
        let graph = &self.graph;
        let cypher = cypher.as_str();
        let params = &params;
        with_backoff(
            || async move {
                let mut q = query(cypher);
                for (key, value) in params.iter() {
                    q = q.param(key, value.clone());
                }
                let mut stream = graph.execute(q).await.map_err(bolt_err)?;
                let mut out = Vec::new();
                while let Some(row) = stream.next().await.map_err(bolt_err)? {
                    out.push(edge_from_row(&row)?);
                }
                Ok(out)
            },
            is_transient,
        )
        .await
    }

    async fn count_endpoints(&self, index: &str, a: &str, b: &str) -> Result<i64, RepoError> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (n:Node) WHERE n.index = $idx AND n.id IN [$a, $b] \
                     RETURN count(n) AS c",
                )
                .param("idx", index)
                .param("a", a)
                .param("b", b),
            )
            .await
            .map_err(bolt_err)?;
        match stream.next().await.map_err(bolt_err)? {
            Some(row) => col(&row, "c"),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GraphRepository for Neo4jRepository {
    async fn insert_node(&self, node: &Node) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        let graph = &self.graph;
        let created_at = chrono::Utc::now().timestamp_millis();
        with_backoff(
            || async move {
                graph
                    .run(
                        query(
                            "MERGE (n:Node {id: $id}) \
                             SET n.index = $idx, n.name = $name, n.kind = $kind, \
                                 n.desc = $desc, \
                                 n.created_at = coalesce(n.created_at, $created_at)",
                        )
                        .param("id", node.id.clone())
                        .param("idx", node.index.clone())
                        .param("name", node.name.clone())
                        .param("kind", node.kind.clone())
                        .param("desc", node.desc.clone())
                        .param("created_at", created_at),
                    )
                    .await
                    .map_err(bolt_err)
            },
            is_transient,
        )
        .await
    }

    async fn update_node_desc(&self, index: &str, id: &str, desc: &str) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (n:Node {id: $id, index: $idx}) SET n.desc = $desc \
                     RETURN n.id AS id",
                )
                .param("id", id)
                .param("idx", index)
                .param("desc", desc),
            )
            .await
            .map_err(bolt_err)?;
        match stream.next().await.map_err(bolt_err)? {
            Some(_) => Ok(()),
            None => Err(RepoError::NotFound(format!("node {id} in {index}"))),
        }
    }

    async fn get_nodes(&self, index: &str) -> Result<Vec<Node>, RepoError> {
        self.ensure_constraints().await?;
        let graph = &self.graph;
        with_backoff(
            || async move {
                let mut stream = graph
                    .execute(
                        query(
                            "MATCH (n:Node {index: $idx}) \
                             RETURN n.id AS id, n.index AS idx, n.name AS name, \
                                    n.kind AS kind, n.desc AS desc \
                             ORDER BY n.created_at, n.id",
                        )
                        .param("idx", index),
                    )
                    .await
                    .map_err(bolt_err)?;
                let mut out = Vec::new();
                while let Some(row) = stream.next().await.map_err(bolt_err)? {
                    out.push(node_from_row(&row)?);
                }
                Ok(out)
            },
            is_transient,
        )
        .await
    }

    async fn get_nodes_by_ids(&self, ids: &[String]) -> Result<Vec<Node>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (n:Node) WHERE n.id IN $ids \
                     RETURN n.id AS id, n.index AS idx, n.name AS name, \
                            n.kind AS kind, n.desc AS desc",
                )
                .param("ids", ids.to_vec()),
            )
            .await
            .map_err(bolt_err)?;

        let mut by_id: HashMap<String, Node> = HashMap::new();
        while let Some(row) = stream.next().await.map_err(bolt_err)? {
            let node = node_from_row(&row)?;
            by_id.insert(node.id.clone(), node);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        if edge.source == edge.target {
            return Err(RepoError::Integrity(format!(
                "self-loop on node {}",
                edge.source
            )));
        }
        if self
            .count_endpoints(&edge.index, &edge.source, &edge.target)
            .await?
            != 2
        {
            return Err(RepoError::Integrity(format!(
                "edge {} references a missing endpoint",
                edge.id
            )));
        }

        // An undirected duplicate merges labels into the stored edge instead
        // of writing a second relationship.
        if let Some(existing) = self
            .get_edge_between(&edge.index, &edge.source, &edge.target)
            .await?
        {
            let merged = merge_relation_labels(&existing.relationship, &edge.relationship);
            if merged != existing.relationship {
                self.update_edge_relationship(&edge.index, &existing.id, &merged)
                    .await?;
            }
            return Ok(());
        }

        let (edge_id, reversed) =
            normalized_edge_id(&edge.index, &edge.source, &edge.target, &edge.relationship);
        let (norm_source, norm_target) = if reversed {
            (edge.target.clone(), edge.source.clone())
        } else {
            (edge.source.clone(), edge.target.clone())
        };

        let graph = &self.graph;
        let created_at = chrono::Utc::now().timestamp_millis();
        let edge_id = &edge_id;
        let norm_source = &norm_source;
        let norm_target = &norm_target;
        with_backoff(
            || async move {
                graph
                    .run(
                        query(
                            "MATCH (a:Node {id: $source}), (b:Node {id: $target}) \
                             MERGE (a)-[r:RELATES_TO {id: $id}]->(b) \
                             SET r.index = $idx, r.relationship = $relationship, \
                                 r.reversed = $reversed, \
                                 r.created_at = coalesce(r.created_at, $created_at)",
                        )
                        .param("source", norm_source.clone())
                        .param("target", norm_target.clone())
                        .param("id", edge_id.clone())
                        .param("idx", edge.index.clone())
                        .param("relationship", edge.relationship.clone())
                        .param("reversed", reversed)
                        .param("created_at", created_at),
                    )
                    .await
                    .map_err(bolt_err)
            },
            is_transient,
        )
        .await
    }

    async fn update_edge_relationship(
        &self,
        index: &str,
        id: &str,
        relationship: &str,
    ) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        self.graph
            .run(
                query(
                    "MATCH ()-[r:RELATES_TO {id: $id, index: $idx}]->() \
                     SET r.relationship = $relationship",
                )
                .param("id", id)
                .param("idx", index)
                .param("relationship", relationship),
            )
            .await
            .map_err(bolt_err)
    }

    async fn delete_edge(&self, index: &str, id: &str) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        self.graph
            .run(
                query("MATCH ()-[r:RELATES_TO {id: $id, index: $idx}]->() DELETE r")
                    .param("id", id)
                    .param("idx", index),
            )
            .await
            .map_err(bolt_err)
    }

    async fn get_edges(&self, index: &str) -> Result<Vec<Edge>, RepoError> {
        self.fetch_edges(
            format!(
                "MATCH ()-[r:RELATES_TO {{index: $idx}}]->() {EDGE_RETURN} \
                 ORDER BY r.created_at, r.id"
            ),
            vec![("idx", index.to_string())],
        )
        .await
    }

    async fn get_edge_between(
        &self,
        index: &str,
        a: &str,
        b: &str,
    ) -> Result<Option<Edge>, RepoError> {
        let edges = self
            .fetch_edges(
                format!(
                    "MATCH (s:Node {{id: $a}})-[r:RELATES_TO {{index: $idx}}]-(t:Node {{id: $b}}) \
                     {EDGE_RETURN} ORDER BY r.created_at, r.id LIMIT 1"
                ),
                vec![
                    ("idx", index.to_string()),
                    ("a", a.to_string()),
                    ("b", b.to_string()),
                ],
            )
            .await?;
        Ok(edges.into_iter().next())
    }

    async fn get_edges_by_node_ids(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<Vec<Edge>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_constraints().await?;
        let mut q = query(&format!(
            "MATCH (s:Node)-[r:RELATES_TO {{index: $idx}}]->(t:Node) \
             WHERE s.id IN $ids OR t.id IN $ids \
             {EDGE_RETURN} ORDER BY r.created_at, r.id"
        ));
        q = q.param("idx", index).param("ids", ids.to_vec());

        let mut stream = self.graph.execute(q).await.map_err(bolt_err)?;
        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(bolt_err)? {
            out.push(edge_from_row(&row)?);
        }
        Ok(out)
    }

    async fn replace_communities(
        &self,
        index: &str,
        memberships: &[CommunityMembership],
    ) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        self.graph
            .run(query("MATCH (c:Community {index: $idx}) DELETE c").param("idx", index))
            .await
            .map_err(bolt_err)?;
        self.graph
            .run(query("MATCH (m:CommunityNode {index: $idx}) DELETE m").param("idx", index))
            .await
            .map_err(bolt_err)?;

        for membership in memberships {
            self.graph
                .run(
                    query(
                        "CREATE (:CommunityNode {index: $idx, community_id: $cid, \
                         node_id: $node_id})",
                    )
                    .param("idx", membership.index.clone())
                    .param("cid", membership.community_id.clone())
                    .param("node_id", membership.node_id.clone()),
                )
                .await
                .map_err(bolt_err)?;
        }
        Ok(())
    }

    async fn upsert_community_summary(&self, community: &Community) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        self.graph
            .run(
                query(
                    "MERGE (c:Community {index: $idx, community_id: $cid}) \
                     SET c.summaries = $summaries",
                )
                .param("idx", community.index.clone())
                .param("cid", community.community_id.clone())
                .param("summaries", community.summaries.clone()),
            )
            .await
            .map_err(bolt_err)
    }

    async fn get_communities(&self, index: &str) -> Result<Vec<Community>, RepoError> {
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (c:Community {index: $idx}) \
                     RETURN c.community_id AS community_id, c.summaries AS summaries \
                     ORDER BY community_id",
                )
                .param("idx", index),
            )
            .await
            .map_err(bolt_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(bolt_err)? {
            out.push(Community {
                community_id: col(&row, "community_id")?,
                index: index.to_string(),
                summaries: col(&row, "summaries")?,
            });
        }
        Ok(out)
    }

    async fn get_memberships(&self, index: &str) -> Result<Vec<CommunityMembership>, RepoError> {
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (m:CommunityNode {index: $idx}) \
                     RETURN m.community_id AS community_id, m.node_id AS node_id \
                     ORDER BY community_id, node_id",
                )
                .param("idx", index),
            )
            .await
            .map_err(bolt_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(bolt_err)? {
            out.push(CommunityMembership {
                index: index.to_string(),
                community_id: col(&row, "community_id")?,
                node_id: col(&row, "node_id")?,
            });
        }
        Ok(out)
    }

    async fn upsert_global(&self, global: &GlobalSummary) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        self.graph
            .run(
                query("MERGE (g:Global {index: $idx}) SET g.summaries = $summaries")
                    .param("idx", global.index.clone())
                    .param("summaries", global.summaries.clone()),
            )
            .await
            .map_err(bolt_err)
    }

    async fn get_global(&self, index: &str) -> Result<Option<GlobalSummary>, RepoError> {
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(
                query("MATCH (g:Global {index: $idx}) RETURN g.summaries AS summaries")
                    .param("idx", index),
            )
            .await
            .map_err(bolt_err)?;

        match stream.next().await.map_err(bolt_err)? {
            Some(row) => Ok(Some(GlobalSummary {
                index: index.to_string(),
                summaries: col(&row, "summaries")?,
            })),
            None => Ok(None),
        }
    }

    async fn list_indices(&self) -> Result<Vec<String>, RepoError> {
        self.ensure_constraints().await?;
        let mut stream = self
            .graph
            .execute(query(
                "MATCH (n:Node) RETURN DISTINCT n.index AS idx ORDER BY idx",
            ))
            .await
            .map_err(bolt_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(bolt_err)? {
            out.push(col::<String>(&row, "idx")?);
        }
        Ok(out)
    }

    async fn delete_index_data(&self, index: &str) -> Result<(), RepoError> {
        self.ensure_constraints().await?;
        // Referential order: globals, communities, memberships, edges, nodes.
        for cypher in [
            "MATCH (g:Global {index: $idx}) DELETE g",
            "MATCH (c:Community {index: $idx}) DELETE c",
            "MATCH (m:CommunityNode {index: $idx}) DELETE m",
            "MATCH ()-[r:RELATES_TO {index: $idx}]->() DELETE r",
            "MATCH (n:Node {index: $idx}) DETACH DELETE n",
        ] {
            self.graph
                .run(query(cypher).param("idx", index))
                .await
                .map_err(bolt_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_id_is_direction_normalized() {
        let (forward, forward_reversed) = normalized_edge_id("idx", "a", "b", "knows");
        let (backward, backward_reversed) = normalized_edge_id("idx", "b", "a", "knows");

        assert_eq!(forward, backward);
        assert!(!forward_reversed);
        assert!(backward_reversed);
    }

    #[test]
    fn edge_id_varies_with_relationship_and_index() {
        let (base, _) = normalized_edge_id("idx", "a", "b", "knows");
        let (other_rel, _) = normalized_edge_id("idx", "a", "b", "likes");
        let (other_idx, _) = normalized_edge_id("idx2", "a", "b", "knows");

        assert_ne!(base, other_rel);
        assert_ne!(base, other_idx);
    }

    #[test]
    fn label_merge_unions_without_losing_parts() {
        let merged = merge_relation_labels("works with; mentors", "mentors; funds");
        assert_eq!(merged, "works with; mentors; funds");
    }

    #[test]
    fn label_merge_trims_and_skips_empty_parts() {
        let merged = merge_relation_labels("knows ; ", " knows;  advises");
        assert_eq!(merged, "knows; advises");
    }
}
