use crate::repo::{with_backoff, GraphRepository, RepoError};
use async_trait::async_trait;
use graphmind_core::model::{Community, CommunityMembership, Edge, GlobalSummary, Node};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;

/// Relational adapter over Postgres. Five tables scoped by `graph_index`;
/// referential integrity (dangling endpoints, self-loops) is enforced by
/// constraints and surfaces as `RepoError::Integrity`.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(url: &str) -> Result<Self, RepoError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(map_sql_err)?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the five tables when missing. Safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<(), RepoError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS nodes (
                 seq BIGSERIAL,
                 id TEXT PRIMARY KEY,
                 graph_index TEXT NOT NULL,
                 name TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 descr TEXT NOT NULL DEFAULT '',
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
            "CREATE INDEX IF NOT EXISTS nodes_graph_index ON nodes (graph_index)",
            "CREATE TABLE IF NOT EXISTS edges (
                 seq BIGSERIAL,
                 id TEXT PRIMARY KEY,
                 graph_index TEXT NOT NULL,
                 source TEXT NOT NULL REFERENCES nodes (id),
                 target TEXT NOT NULL REFERENCES nodes (id),
                 relationship TEXT NOT NULL DEFAULT '',
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 CHECK (source <> target)
             )",
            "CREATE INDEX IF NOT EXISTS edges_graph_index ON edges (graph_index)",
            "CREATE TABLE IF NOT EXISTS communities (
                 graph_index TEXT NOT NULL,
                 community_id TEXT NOT NULL,
                 summaries TEXT NOT NULL DEFAULT '',
                 PRIMARY KEY (graph_index, community_id)
             )",
            "CREATE TABLE IF NOT EXISTS community_nodes (
                 graph_index TEXT NOT NULL,
                 community_id TEXT NOT NULL,
                 node_id TEXT NOT NULL REFERENCES nodes (id)
             )",
            "CREATE TABLE IF NOT EXISTS globals (
                 graph_index TEXT PRIMARY KEY,
                 summaries TEXT NOT NULL DEFAULT ''
             )",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sql_err)?;
        }
        tracing::debug!("relational schema ready");
        Ok(())
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

fn map_sql_err(err: sqlx::Error) -> RepoError {
    match &err {
        sqlx::Error::RowNotFound => RepoError::NotFound(err.to_string()),
        sqlx::Error::Database(db) => {
            // 23503 foreign key, 23514 check constraint.
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code == "23503" || code == "23514" {
                RepoError::Integrity(db.message().to_string())
            } else {
                RepoError::Backend(db.message().to_string())
            }
        }
        _ => RepoError::Backend(err.to_string()),
    }
}

fn node_from_row(row: &PgRow) -> Result<Node, sqlx::Error> {
    Ok(Node {
        id: row.try_get("id")?,
        index: row.try_get("graph_index")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        desc: row.try_get("descr")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<Edge, sqlx::Error> {
    Ok(Edge {
        id: row.try_get("id")?,
        index: row.try_get("graph_index")?,
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        relationship: row.try_get("relationship")?,
    })
}

#[async_trait]
impl GraphRepository for PostgresRepository {
    async fn insert_node(&self, node: &Node) -> Result<(), RepoError> {
        let pool = &self.pool;
        with_backoff(
            || async move {
                sqlx::query(
                    "INSERT INTO nodes (id, graph_index, name, kind, descr)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (id) DO UPDATE
                     SET name = EXCLUDED.name, kind = EXCLUDED.kind,
                         descr = EXCLUDED.descr, updated_at = now()",
                )
                .bind(&node.id)
                .bind(&node.index)
                .bind(&node.name)
                .bind(&node.kind)
                .bind(&node.desc)
                .execute(pool)
                .await
                .map(|_| ())
            },
            is_transient,
        )
        .await
        .map_err(map_sql_err)
    }

    async fn update_node_desc(&self, index: &str, id: &str, desc: &str) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE nodes SET descr = $3, updated_at = now()
             WHERE graph_index = $1 AND id = $2",
        )
        .bind(index)
        .bind(id)
        .bind(desc)
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("node {id} in {index}")));
        }
        Ok(())
    }

    async fn get_nodes(&self, index: &str) -> Result<Vec<Node>, RepoError> {
        let pool = &self.pool;
        let rows = with_backoff(
            || async move {
                sqlx::query(
                    "SELECT id, graph_index, name, kind, descr FROM nodes
                     WHERE graph_index = $1 ORDER BY seq",
                )
                .bind(index)
                .fetch_all(pool)
                .await
            },
            is_transient,
        )
        .await
        .map_err(map_sql_err)?;

        rows.iter().map(node_from_row).collect::<Result<_, _>>().map_err(map_sql_err)
    }

    async fn get_nodes_by_ids(&self, ids: &[String]) -> Result<Vec<Node>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, graph_index, name, kind, descr FROM nodes WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sql_err)?;

        let mut by_id: HashMap<String, Node> = HashMap::new();
        for row in &rows {
            let node = node_from_row(row).map_err(map_sql_err)?;
            by_id.insert(node.id.clone(), node);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepoError> {
        if edge.source == edge.target {
            return Err(RepoError::Integrity(format!(
                "self-loop on node {}",
                edge.source
            )));
        }

        let endpoints: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes WHERE graph_index = $1 AND id IN ($2, $3)",
        )
        .bind(&edge.index)
        .bind(&edge.source)
        .bind(&edge.target)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sql_err)?;
        if endpoints != 2 {
            return Err(RepoError::Integrity(format!(
                "edge {} references a missing endpoint",
                edge.id
            )));
        }

        sqlx::query(
            "INSERT INTO edges (id, graph_index, source, target, relationship)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET relationship = EXCLUDED.relationship",
        )
        .bind(&edge.id)
        .bind(&edge.index)
        .bind(&edge.source)
        .bind(&edge.target)
        .bind(&edge.relationship)
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;
        Ok(())
    }

    async fn update_edge_relationship(
        &self,
        index: &str,
        id: &str,
        relationship: &str,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE edges SET relationship = $3 WHERE graph_index = $1 AND id = $2",
        )
        .bind(index)
        .bind(id)
        .bind(relationship)
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("edge {id} in {index}")));
        }
        Ok(())
    }

    async fn delete_edge(&self, index: &str, id: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM edges WHERE graph_index = $1 AND id = $2")
            .bind(index)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
        Ok(())
    }

    async fn get_edges(&self, index: &str) -> Result<Vec<Edge>, RepoError> {
        let pool = &self.pool;
        let rows = with_backoff(
            || async move {
                sqlx::query(
                    "SELECT id, graph_index, source, target, relationship FROM edges
                     WHERE graph_index = $1 ORDER BY seq",
                )
                .bind(index)
                .fetch_all(pool)
                .await
            },
            is_transient,
        )
        .await
        .map_err(map_sql_err)?;

        rows.iter().map(edge_from_row).collect::<Result<_, _>>().map_err(map_sql_err)
    }

    async fn get_edge_between(
        &self,
        index: &str,
        a: &str,
        b: &str,
    ) -> Result<Option<Edge>, RepoError> {
        let row = sqlx::query(
            "SELECT id, graph_index, source, target, relationship FROM edges
             WHERE graph_index = $1
               AND ((source = $2 AND target = $3) OR (source = $3 AND target = $2))
             ORDER BY seq LIMIT 1",
        )
        .bind(index)
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sql_err)?;

        row.as_ref()
            .map(edge_from_row)
            .transpose()
            .map_err(map_sql_err)
    }

    async fn get_edges_by_node_ids(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<Vec<Edge>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, graph_index, source, target, relationship FROM edges
             WHERE graph_index = $1 AND (source = ANY($2) OR target = ANY($2))
             ORDER BY seq",
        )
        .bind(index)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sql_err)?;

        rows.iter().map(edge_from_row).collect::<Result<_, _>>().map_err(map_sql_err)
    }

    async fn replace_communities(
        &self,
        index: &str,
        memberships: &[CommunityMembership],
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_sql_err)?;

        sqlx::query("DELETE FROM communities WHERE graph_index = $1")
            .bind(index)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;
        sqlx::query("DELETE FROM community_nodes WHERE graph_index = $1")
            .bind(index)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

        for membership in memberships {
            sqlx::query(
                "INSERT INTO community_nodes (graph_index, community_id, node_id)
                 VALUES ($1, $2, $3)",
            )
            .bind(&membership.index)
            .bind(&membership.community_id)
            .bind(&membership.node_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;
        }

        tx.commit().await.map_err(map_sql_err)
    }

    async fn upsert_community_summary(&self, community: &Community) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO communities (graph_index, community_id, summaries)
             VALUES ($1, $2, $3)
             ON CONFLICT (graph_index, community_id) DO UPDATE
             SET summaries = EXCLUDED.summaries",
        )
        .bind(&community.index)
        .bind(&community.community_id)
        .bind(&community.summaries)
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;
        Ok(())
    }

    async fn get_communities(&self, index: &str) -> Result<Vec<Community>, RepoError> {
        let rows = sqlx::query(
            "SELECT graph_index, community_id, summaries FROM communities
             WHERE graph_index = $1 ORDER BY community_id",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sql_err)?;

        rows.iter()
            .map(|row| {
                Ok(Community {
                    index: row.try_get("graph_index")?,
                    community_id: row.try_get("community_id")?,
                    summaries: row.try_get("summaries")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_sql_err)
    }

    async fn get_memberships(&self, index: &str) -> Result<Vec<CommunityMembership>, RepoError> {
        let rows = sqlx::query(
            "SELECT graph_index, community_id, node_id FROM community_nodes
             WHERE graph_index = $1 ORDER BY community_id, node_id",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sql_err)?;

        rows.iter()
            .map(|row| {
                Ok(CommunityMembership {
                    index: row.try_get("graph_index")?,
                    community_id: row.try_get("community_id")?,
                    node_id: row.try_get("node_id")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_sql_err)
    }

    async fn upsert_global(&self, global: &GlobalSummary) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO globals (graph_index, summaries) VALUES ($1, $2)
             ON CONFLICT (graph_index) DO UPDATE SET summaries = EXCLUDED.summaries",
        )
        .bind(&global.index)
        .bind(&global.summaries)
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;
        Ok(())
    }

    async fn get_global(&self, index: &str) -> Result<Option<GlobalSummary>, RepoError> {
        let row = sqlx::query("SELECT graph_index, summaries FROM globals WHERE graph_index = $1")
            .bind(index)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql_err)?;

        row.map(|row| {
            Ok(GlobalSummary {
                index: row.try_get("graph_index")?,
                summaries: row.try_get("summaries")?,
            })
        })
        .transpose()
        .map_err(map_sql_err)
    }

    async fn list_indices(&self) -> Result<Vec<String>, RepoError> {
        let rows = sqlx::query_scalar(
            "SELECT DISTINCT graph_index FROM nodes ORDER BY graph_index",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sql_err)?;
        Ok(rows)
    }

    async fn delete_index_data(&self, index: &str) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_sql_err)?;

        // Referential order: globals, communities, memberships, edges, nodes.
        for statement in [
            "DELETE FROM globals WHERE graph_index = $1",
            "DELETE FROM communities WHERE graph_index = $1",
            "DELETE FROM community_nodes WHERE graph_index = $1",
            "DELETE FROM edges WHERE graph_index = $1",
            "DELETE FROM nodes WHERE graph_index = $1",
        ] {
            sqlx::query(statement)
                .bind(index)
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;
        }

        tx.commit().await.map_err(map_sql_err)
    }
}
