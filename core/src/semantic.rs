use crate::error::{ErrorCode, GraphmindError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("malformed model output: {0}")]
    Malformed(String),
}

impl GraphmindError for SemanticError {
    fn error_code(&self) -> ErrorCode {
        match self {
            SemanticError::Model(_) => ErrorCode::Unavailable,
            SemanticError::Malformed(_) => ErrorCode::Internal,
        }
    }
}

/// Node proposed by structured extraction. `local_id` is only meaningful
/// within the extraction call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedNode {
    pub local_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub desc: String,
}

impl ExtractedNode {
    pub fn new(
        local_id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            name: name.into(),
            kind: kind.into(),
            desc: desc.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEdge {
    pub source_local_id: String,
    pub target_local_id: String,
    pub relationship: String,
}

impl ExtractedEdge {
    pub fn new(
        source_local_id: impl Into<String>,
        target_local_id: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            source_local_id: source_local_id.into(),
            target_local_id: target_local_id.into(),
            relationship: relationship.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphExtraction {
    pub nodes: Vec<ExtractedNode>,
    pub edges: Vec<ExtractedEdge>,
}

/// Which of the two judged descriptions is the relation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLabel {
    Node1,
    Node2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationJudgement {
    pub related: bool,
    pub source: SourceLabel,
    pub relationship: String,
}

impl RelationJudgement {
    pub fn unrelated() -> Self {
        Self {
            related: false,
            source: SourceLabel::Node1,
            relationship: String::new(),
        }
    }
}

/// Lazy sequence of answer fragments; restartable per call.
pub type AnswerStream = BoxStream<'static, Result<String, SemanticError>>;

/// Language-model capability set the engine depends on. Prompting, rate
/// limiting, and token accounting live behind the implementation.
#[async_trait]
pub trait SemanticClient: Send + Sync {
    /// Structured graph extraction over a chunk of text.
    async fn extract_graph(&self, text: &str) -> Result<GraphExtraction, SemanticError>;

    /// Synthesizes one description from two. An empty result tells the
    /// caller to fall back to a `"; "` concatenation.
    async fn merge_descriptions(&self, a: &str, b: &str) -> Result<String, SemanticError>;

    /// Decides whether two described nodes are related and in which
    /// direction; `SourceLabel::Node1` means `desc_a` is the source.
    async fn infer_relation(
        &self,
        desc_a: &str,
        desc_b: &str,
    ) -> Result<RelationJudgement, SemanticError>;

    async fn summarize_community(&self, member_block: &str) -> Result<String, SemanticError>;

    async fn summarize_global(&self, community_block: &str) -> Result<String, SemanticError>;

    async fn answer(&self, subgraph_json: &str, question: &str) -> Result<String, SemanticError>;

    async fn answer_stream(
        &self,
        subgraph_json: &str,
        question: &str,
    ) -> Result<AnswerStream, SemanticError>;
}

/// Scriptable client for tests and model-free runs: extractions are queued,
/// relation judgements match on substrings of the judged descriptions, and
/// merges/answers are canned.
pub struct MockSemanticClient {
    extractions: Mutex<VecDeque<Result<GraphExtraction, String>>>,
    relations: Mutex<Vec<(String, String, RelationJudgement)>>,
    default_relation: Mutex<RelationJudgement>,
    merge_output: Mutex<Option<String>>,
    answer_text: Mutex<Option<String>>,
    last_context: Mutex<Option<String>>,
    extract_calls: AtomicUsize,
    answer_calls: AtomicUsize,
}

impl MockSemanticClient {
    pub fn new() -> Self {
        Self {
            extractions: Mutex::new(VecDeque::new()),
            relations: Mutex::new(Vec::new()),
            default_relation: Mutex::new(RelationJudgement::unrelated()),
            merge_output: Mutex::new(None),
            answer_text: Mutex::new(None),
            last_context: Mutex::new(None),
            extract_calls: AtomicUsize::new(0),
            answer_calls: AtomicUsize::new(0),
        }
    }

    /// Queues the extraction returned by the next `extract_graph` call.
    pub fn push_extraction(&self, extraction: GraphExtraction) {
        self.extractions.lock().unwrap().push_back(Ok(extraction));
    }

    pub fn push_extraction_failure(&self, message: impl Into<String>) {
        self.extractions
            .lock()
            .unwrap()
            .push_back(Err(message.into()));
    }

    /// Registers a judgement for description pairs where `desc_a` contains
    /// `needle_a` and `desc_b` contains `needle_b`.
    pub fn relate(
        &self,
        needle_a: impl Into<String>,
        needle_b: impl Into<String>,
        judgement: RelationJudgement,
    ) {
        self.relations
            .lock()
            .unwrap()
            .push((needle_a.into(), needle_b.into(), judgement));
    }

    /// Judgement used when no registered pair matches.
    pub fn set_default_relation(&self, judgement: RelationJudgement) {
        *self.default_relation.lock().unwrap() = judgement;
    }

    /// `None` makes `merge_descriptions` return an empty string so callers
    /// exercise their concatenation fallback.
    pub fn set_merge_output(&self, output: Option<String>) {
        *self.merge_output.lock().unwrap() = output;
    }

    pub fn set_answer(&self, text: impl Into<String>) {
        *self.answer_text.lock().unwrap() = Some(text.into());
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    /// The subgraph JSON handed to the most recent answer call.
    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }

    fn render_answer(&self, subgraph_json: &str, question: &str) -> String {
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap() = Some(subgraph_json.to_string());
        self.answer_text
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| format!("answer: {}", question))
    }
}

impl Default for MockSemanticClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SemanticClient for MockSemanticClient {
    async fn extract_graph(&self, _text: &str) -> Result<GraphExtraction, SemanticError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        match self.extractions.lock().unwrap().pop_front() {
            Some(Ok(extraction)) => Ok(extraction),
            Some(Err(message)) => Err(SemanticError::Model(message)),
            None => Ok(GraphExtraction::default()),
        }
    }

    async fn merge_descriptions(&self, _a: &str, _b: &str) -> Result<String, SemanticError> {
        Ok(self.merge_output.lock().unwrap().clone().unwrap_or_default())
    }

    async fn infer_relation(
        &self,
        desc_a: &str,
        desc_b: &str,
    ) -> Result<RelationJudgement, SemanticError> {
        let relations = self.relations.lock().unwrap();
        for (needle_a, needle_b, judgement) in relations.iter() {
            if desc_a.contains(needle_a.as_str()) && desc_b.contains(needle_b.as_str()) {
                return Ok(judgement.clone());
            }
        }
        Ok(self.default_relation.lock().unwrap().clone())
    }

    async fn summarize_community(&self, member_block: &str) -> Result<String, SemanticError> {
        let first = member_block.lines().next().unwrap_or_default();
        Ok(format!("community of: {}", first))
    }

    async fn summarize_global(&self, community_block: &str) -> Result<String, SemanticError> {
        Ok(format!(
            "global over {} communities",
            community_block.lines().filter(|l| !l.is_empty()).count()
        ))
    }

    async fn answer(&self, subgraph_json: &str, question: &str) -> Result<String, SemanticError> {
        Ok(self.render_answer(subgraph_json, question))
    }

    async fn answer_stream(
        &self,
        subgraph_json: &str,
        question: &str,
    ) -> Result<AnswerStream, SemanticError> {
        let answer = self.render_answer(subgraph_json, question);
        let fragments: Vec<Result<String, SemanticError>> = answer
            .split_inclusive(' ')
            .map(|fragment| Ok(fragment.to_string()))
            .collect();
        Ok(stream::iter(fragments).boxed())
    }
}
