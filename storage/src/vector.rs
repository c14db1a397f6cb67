use async_trait::async_trait;
use dashmap::DashMap;
use graphmind_core::vector::{Embedder, VectorError, VectorHit, VectorMemory};
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, DeletePointsBuilder, Distance, PointId, PointStruct, PointsIdsList,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Relevance `1.0` marks exact semantic identity: identical payload text.
const IDENTITY_RELEVANCE: f32 = 1.0;
/// Ceiling for non-identical hits so `1.0` stays reserved.
const NEAR_IDENTITY_CAP: f32 = 0.99;

/// Process-local vector memory scoring by content-token overlap. The
/// `Name:/Type:/Desc:` scaffolding of stored payloads is discounted before
/// scoring, so two unrelated nodes never look similar just because both are
/// payloads. Identical text scores exactly `1.0`; everything else is capped
/// below it. Relevances are fully predictable, which the dedup tests rely
/// on.
pub struct InMemoryVectorMemory {
    entries: DashMap<(String, String), String>,
}

impl InMemoryVectorMemory {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries for `index`.
    pub fn count(&self, index: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().0 == index)
            .count()
    }
}

impl Default for InMemoryVectorMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorMemory for InMemoryVectorMemory {
    async fn save(&self, index: &str, id: &str, text: &str) -> Result<(), VectorError> {
        self.entries
            .insert((index.to_string(), id.to_string()), text.to_string());
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        limit: usize,
        min_relevance: f32,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let query_tokens = content_tokens(query);

        let mut hits: Vec<VectorHit> = Vec::new();
        for entry in self.entries.iter() {
            if entry.key().0 != index {
                continue;
            }
            let text = entry.value();
            let relevance = if text == query {
                IDENTITY_RELEVANCE
            } else {
                overlap_relevance(&query_tokens, &content_tokens(text)).min(NEAR_IDENTITY_CAP)
            };
            if relevance >= min_relevance {
                hits.push(VectorHit {
                    id: entry.key().1.clone(),
                    text: text.clone(),
                    relevance,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn remove(&self, index: &str, id: &str) -> Result<(), VectorError> {
        self.entries.remove(&(index.to_string(), id.to_string()));
        Ok(())
    }
}

/// Field markers of the canonical `Name:…;Type:…;Desc:…` payload. Every
/// stored entry carries them, so they would dominate any overlap score if
/// they were allowed to count.
const PAYLOAD_LABELS: [&str; 3] = ["name", "type", "desc"];

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

/// Content tokens of a payload or free-text query: lowercased alphanumeric
/// words minus the payload field labels. CJK runs carry no word boundaries,
/// so each CJK code point becomes its own token; any latin remainder of a
/// mixed run is kept as one token.
fn content_tokens(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for word in text.split(|ch: char| !ch.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let word = word.to_lowercase();
        if PAYLOAD_LABELS.contains(&word.as_str()) {
            continue;
        }
        if word.chars().any(is_cjk) {
            let mut rest = String::new();
            for ch in word.chars() {
                if is_cjk(ch) {
                    tokens.insert(ch.to_string());
                } else {
                    rest.push(ch);
                }
            }
            if !rest.is_empty() {
                tokens.insert(rest);
            }
        } else {
            tokens.insert(word);
        }
    }
    tokens
}

/// Jaccard overlap of two content-token sets: shared over combined size.
fn overlap_relevance(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let shared = a.intersection(b).count();
    if shared == 0 {
        return 0.0;
    }
    let combined = a.len() + b.len() - shared;
    shared as f32 / combined as f32
}

/// Qdrant-backed vector memory: one collection per index, points keyed by
/// node id, payload carries the raw text. Vectors come from the injected
/// embedder.
pub struct QdrantVectorMemory {
    client: Qdrant,
    embedder: Arc<dyn Embedder>,
    vector_size: u64,
    ready: DashMap<String, ()>,
}

fn qdrant_err(err: impl std::fmt::Display) -> VectorError {
    VectorError::Backend(err.to_string())
}

fn collection_name(index: &str) -> String {
    format!("graphmind_{index}")
}

impl QdrantVectorMemory {
    pub fn connect(
        url: &str,
        vector_size: u64,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, VectorError> {
        let client = Qdrant::from_url(url).build().map_err(qdrant_err)?;
        Ok(Self {
            client,
            embedder,
            vector_size,
            ready: DashMap::new(),
        })
    }

    async fn ensure_collection(&self, index: &str) -> Result<String, VectorError> {
        let name = collection_name(index);
        if self.ready.contains_key(&name) {
            return Ok(name);
        }

        let exists = self
            .client
            .collection_exists(&name)
            .await
            .map_err(qdrant_err)?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&name).vectors_config(
                        VectorParamsBuilder::new(self.vector_size, Distance::Cosine),
                    ),
                )
                .await
                .map_err(qdrant_err)?;
        }
        self.ready.insert(name.clone(), ());
        Ok(name)
    }
}

#[async_trait]
impl VectorMemory for QdrantVectorMemory {
    async fn save(&self, index: &str, id: &str, text: &str) -> Result<(), VectorError> {
        let collection = self.ensure_collection(index).await?;
        let vector = self.embedder.embed(text).await;
        let payload = Payload::try_from(serde_json::json!({ "text": text }))
            .map_err(qdrant_err)?;
        let point = PointStruct::new(id.to_string(), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![point]).wait(true))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        limit: usize,
        min_relevance: f32,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let collection = collection_name(index);
        let exists = self
            .client
            .collection_exists(&collection)
            .await
            .map_err(qdrant_err)?;
        if !exists {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await;
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(collection, vector, limit as u64)
                    .score_threshold(min_relevance)
                    .with_payload(true),
            )
            .await
            .map_err(qdrant_err)?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let Some(id) = point.id.and_then(point_id_string) else {
                continue;
            };
            let text = point
                .payload
                .get("text")
                .and_then(|value| match &value.kind {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let relevance = if text == query {
                IDENTITY_RELEVANCE
            } else {
                point.score.clamp(0.0, NEAR_IDENTITY_CAP)
            };
            hits.push(VectorHit {
                id,
                text,
                relevance,
            });
        }
        Ok(hits)
    }

    async fn remove(&self, index: &str, id: &str) -> Result<(), VectorError> {
        let collection = collection_name(index);
        let exists = self
            .client
            .collection_exists(&collection)
            .await
            .map_err(qdrant_err)?;
        if !exists {
            return Ok(());
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList {
                        ids: vec![PointId::from(id.to_string())],
                    })
                    .wait(true),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }
}

fn point_id_string(id: PointId) -> Option<String> {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.point_id_options {
        Some(PointIdOptions::Uuid(uuid)) => Some(uuid),
        Some(PointIdOptions::Num(num)) => Some(num.to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphmind_core::embedding::DeterministicEmbedder;

    #[test]
    fn qdrant_memory_builds_without_a_reachable_server() {
        // Connection is lazy; construction only validates the URL.
        let embedder = Arc::new(DeterministicEmbedder::new(8));
        assert!(QdrantVectorMemory::connect("http://localhost:6334", 8, embedder).is_ok());
    }

    #[tokio::test]
    async fn identical_text_scores_exactly_one() {
        let memory = InMemoryVectorMemory::new();
        memory
            .save("idx", "n1", "Name:Alice;Type:Person;Desc:a doctor")
            .await
            .unwrap();

        let hits = memory
            .search("idx", "Name:Alice;Type:Person;Desc:a doctor", 5, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance, 1.0);
    }

    #[tokio::test]
    async fn overlapping_text_scores_below_identity() {
        let memory = InMemoryVectorMemory::new();
        memory
            .save("idx", "n1", "Name:Alice;Type:Person;Desc:a doctor")
            .await
            .unwrap();

        let hits = memory
            .search("idx", "Name:Alice;Type:Person;Desc:a surgeon", 5, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].relevance > 0.5);
        assert!(hits[0].relevance < 1.0);
    }

    #[tokio::test]
    async fn payload_scaffolding_does_not_count_as_similarity() {
        let memory = InMemoryVectorMemory::new();
        memory
            .save("idx", "n1", "Name:One;Type:Alpha;Desc:red")
            .await
            .unwrap();

        // Both sides are payloads; with no shared content the shared
        // Name/Type/Desc markers must not produce a score.
        let hits = memory
            .search("idx", "Name:Two;Type:Beta;Desc:blue", 5, 0.05)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn cjk_text_overlaps_per_character() {
        let memory = InMemoryVectorMemory::new();
        memory
            .save("idx", "n1", "Name:北京;Type:City;Desc:中国首都")
            .await
            .unwrap();

        let hits = memory.search("idx", "北京 首都", 5, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].relevance >= 0.5);
        assert!(hits[0].relevance < 1.0);
    }

    #[tokio::test]
    async fn search_respects_threshold_limit_and_index_scope() {
        let memory = InMemoryVectorMemory::new();
        memory.save("idx", "n1", "alpha beta gamma").await.unwrap();
        memory.save("idx", "n2", "alpha beta delta").await.unwrap();
        memory.save("idx", "n3", "unrelated words entirely").await.unwrap();
        memory.save("other", "n4", "alpha beta gamma").await.unwrap();

        let hits = memory.search("idx", "alpha beta gamma", 2, 0.5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "n1");
        assert!(hits.iter().all(|hit| hit.relevance >= 0.5));
    }

    #[tokio::test]
    async fn remove_deletes_the_entry() {
        let memory = InMemoryVectorMemory::new();
        memory.save("idx", "n1", "alpha beta").await.unwrap();
        memory.remove("idx", "n1").await.unwrap();
        assert_eq!(memory.count("idx"), 0);
    }
}
