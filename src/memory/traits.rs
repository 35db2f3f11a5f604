//! Collaborator interfaces consumed by the Memory Ops Facade.
//!
//! All five are implemented externally and injected at construction; the
//! scheduler never builds its own clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// A single textual memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub mem_cube_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl MemoryItem {
    pub fn new(
        user_id: impl Into<String>,
        mem_cube_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            mem_cube_id: mem_cube_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A memory item with a relevance score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f32,
}

/// Dense embedding vector.
pub type Embedding = Vec<f32>;

/// A node in the memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: String,
    pub properties: serde_json::Value,
}

/// A directed edge in the memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Primary textual memory store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist items; returns the stored ids in input order.
    async fn add(&self, items: &[MemoryItem]) -> Result<Vec<String>, MemoryError>;

    /// Fetch items by id. Missing ids are omitted from the result.
    async fn get(&self, ids: &[String]) -> Result<Vec<MemoryItem>, MemoryError>;

    /// Text search scoped to one user and cube.
    async fn search(
        &self,
        user_id: &str,
        mem_cube_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredMemory>, MemoryError>;

    /// Replace the content of an existing item.
    async fn update(&self, id: &str, content: &str) -> Result<(), MemoryError>;

    /// Delete items by id.
    async fn delete(&self, ids: &[String]) -> Result<(), MemoryError>;
}

/// Text → dense vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, MemoryError>;
}

/// Vector index over memory embeddings, keyed by memory id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, ids: &[String], embeddings: &[Embedding]) -> Result<(), MemoryError>;

    /// Nearest-neighbor search; returns (memory id, similarity) pairs.
    async fn search(
        &self,
        embedding: &Embedding,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, MemoryError>;

    /// Ids among `ids` that have an indexed vector.
    async fn contains(&self, ids: &[String]) -> Result<Vec<String>, MemoryError>;

    async fn update(&self, id: &str, embedding: &Embedding) -> Result<(), MemoryError>;

    async fn delete(&self, ids: &[String]) -> Result<(), MemoryError>;
}

/// Graph store for memory relations.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn write_node(&self, node: &GraphNode) -> Result<(), MemoryError>;

    async fn write_edge(&self, edge: &GraphEdge) -> Result<(), MemoryError>;

    /// Query nodes by a backend-specific expression.
    async fn query(&self, query: &str) -> Result<Vec<GraphNode>, MemoryError>;
}

/// LLM used for memory extraction and consolidation.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, MemoryError>;
}
