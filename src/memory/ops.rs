//! Memory Ops Facade — the operations handlers run against the stores.
//!
//! Transient I/O failures are retried here, a bounded number of times with
//! backoff, before surfacing to the worker. This layer is distinct from, and
//! sits beneath, the worker-level task-redelivery retry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BackoffPolicy;
use crate::error::MemoryError;
use crate::memory::traits::{
    Embedder, GraphEdge, GraphNode, GraphStore, Llm, MemoryItem, MemoryStore, ScoredMemory,
    VectorStore,
};

const EXTRACT_PROMPT: &str = "Extract the distinct facts worth remembering from the \
messages below. Return one fact per line, no numbering, no commentary.\n\n";

/// Facade over the injected memory collaborators.
pub struct MemoryOps {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn Llm>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl MemoryOps {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn Llm>,
    ) -> Self {
        Self {
            store,
            embedder,
            vector,
            graph,
            llm,
            max_attempts: 3,
            backoff: BackoffPolicy {
                base: std::time::Duration::from_millis(100),
                multiplier: 2.0,
                cap: std::time::Duration::from_secs(2),
                jitter: 0.1,
            },
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Run `f`, retrying transient failures up to the attempt ceiling.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, MemoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient memory op failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extract memory-worthy facts from raw messages via the LLM.
    pub async fn extract_memories(&self, messages: &[String]) -> Result<Vec<String>, MemoryError> {
        let prompt = format!("{EXTRACT_PROMPT}{}", messages.join("\n"));
        let raw = self.with_retry("llm.generate", || self.llm.generate(&prompt)).await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Persist items across all three stores: text store, vector index, and
    /// graph node per item. Returns the stored ids.
    pub async fn add_memories(&self, items: Vec<MemoryItem>) -> Result<Vec<String>, MemoryError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = items.iter().map(|i| i.content.clone()).collect();
        let embeddings = self.with_retry("embedder.embed", || self.embedder.embed(&texts)).await?;
        if embeddings.len() != items.len() {
            return Err(MemoryError::EmbeddingMismatch {
                expected: items.len(),
                got: embeddings.len(),
            });
        }

        let ids = self.with_retry("store.add", || self.store.add(&items)).await?;
        self.with_retry("vector.insert", || self.vector.insert(&ids, &embeddings))
            .await?;

        for (id, item) in ids.iter().zip(items.iter()) {
            let node = GraphNode {
                id: id.clone(),
                kind: "memory".into(),
                properties: serde_json::json!({
                    "user_id": item.user_id,
                    "mem_cube_id": item.mem_cube_id,
                }),
            };
            self.with_retry("graph.write_node", || self.graph.write_node(&node))
                .await?;
        }

        Ok(ids)
    }

    /// Hybrid search: vector nearest-neighbor merged with text search,
    /// deduplicated by id keeping the higher score.
    pub async fn search_memories(
        &self,
        user_id: &str,
        mem_cube_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        let query_text = vec![query.to_string()];
        let query_vec = self
            .with_retry("embedder.embed", || self.embedder.embed(&query_text))
            .await?
            .into_iter()
            .next()
            .ok_or(MemoryError::EmbeddingMismatch { expected: 1, got: 0 })?;

        let vector_hits = self
            .with_retry("vector.search", || self.vector.search(&query_vec, top_k))
            .await?;
        let text_hits = self
            .with_retry("store.search", || {
                self.store.search(user_id, mem_cube_id, query, top_k)
            })
            .await?;

        let mut merged: HashMap<String, ScoredMemory> = HashMap::new();
        for hit in text_hits {
            merged.insert(hit.item.id.clone(), hit);
        }

        let vector_ids: Vec<String> = vector_hits
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !merged.contains_key(id))
            .collect();
        if !vector_ids.is_empty() {
            let items = self.with_retry("store.get", || self.store.get(&vector_ids)).await?;
            let scores: HashMap<&String, f32> =
                vector_hits.iter().map(|(id, s)| (id, *s)).collect();
            for item in items {
                // Vector hits can span cubes; keep the scope the caller asked for.
                if item.user_id != user_id || item.mem_cube_id != mem_cube_id {
                    continue;
                }
                let score = scores.get(&item.id).copied().unwrap_or(0.0);
                merged.insert(item.id.clone(), ScoredMemory { item, score });
            }
        }

        let mut results: Vec<ScoredMemory> = merged.into_values().collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_k);
        Ok(results)
    }

    /// Rewrite an item's content and refresh its vector entry.
    pub async fn update_memory(&self, id: &str, content: &str) -> Result<(), MemoryError> {
        self.with_retry("store.update", || self.store.update(id, content))
            .await?;
        let content_text = vec![content.to_string()];
        let embedding = self
            .with_retry("embedder.embed", || self.embedder.embed(&content_text))
            .await?
            .into_iter()
            .next()
            .ok_or(MemoryError::EmbeddingMismatch { expected: 1, got: 0 })?;
        self.with_retry("vector.update", || self.vector.update(id, &embedding))
            .await
    }

    /// Delete items from the text store and the vector index.
    pub async fn delete_memories(&self, ids: &[String]) -> Result<(), MemoryError> {
        self.with_retry("store.delete", || self.store.delete(ids)).await?;
        self.with_retry("vector.delete", || self.vector.delete(ids)).await
    }

    /// Fetch items by id, re-inserting any vectors missing from the index.
    ///
    /// Consistency across stores is eventual; this is the reconciliation
    /// path that repairs a vector index that fell behind the text store.
    pub async fn read_and_reconcile(
        &self,
        ids: &[String],
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let items = self.with_retry("store.get", || self.store.get(ids)).await?;
        if items.is_empty() {
            return Ok(items);
        }

        let item_ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let indexed = self
            .with_retry("vector.contains", || self.vector.contains(&item_ids))
            .await?;
        let missing: Vec<&MemoryItem> = items
            .iter()
            .filter(|i| !indexed.contains(&i.id))
            .collect();

        if !missing.is_empty() {
            tracing::info!(count = missing.len(), "Repairing missing vector entries");
            let texts: Vec<String> = missing.iter().map(|i| i.content.clone()).collect();
            let embeddings =
                self.with_retry("embedder.embed", || self.embedder.embed(&texts)).await?;
            let missing_ids: Vec<String> = missing.iter().map(|i| i.id.clone()).collect();
            self.with_retry("vector.insert", || {
                self.vector.insert(&missing_ids, &embeddings)
            })
            .await?;
        }

        Ok(items)
    }

    /// Record that `query` surfaced the given memories, as access edges in
    /// the graph.
    pub async fn link_query_hits(
        &self,
        user_id: &str,
        query_id: &str,
        hits: &[ScoredMemory],
    ) -> Result<(), MemoryError> {
        let node = GraphNode {
            id: query_id.to_string(),
            kind: "query".into(),
            properties: serde_json::json!({ "user_id": user_id }),
        };
        self.with_retry("graph.write_node", || self.graph.write_node(&node))
            .await?;
        for hit in hits {
            let edge = GraphEdge {
                from: query_id.to_string(),
                to: hit.item.id.clone(),
                relation: "accessed".into(),
            };
            self.with_retry("graph.write_edge", || self.graph.write_edge(&edge))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::memory::traits::Embedding;

    /// Embedder that fails transiently `failures` times, then succeeds.
    struct FlakyEmbedder {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, MemoryError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(MemoryError::Transient {
                    op: "embed",
                    reason: "connection reset".into(),
                });
            }
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    struct NullStore;

    #[async_trait]
    impl MemoryStore for NullStore {
        async fn add(&self, items: &[MemoryItem]) -> Result<Vec<String>, MemoryError> {
            Ok(items.iter().map(|i| i.id.clone()).collect())
        }
        async fn get(&self, _ids: &[String]) -> Result<Vec<MemoryItem>, MemoryError> {
            Ok(Vec::new())
        }
        async fn search(
            &self,
            _user_id: &str,
            _mem_cube_id: &str,
            _query: &str,
            _top_k: usize,
        ) -> Result<Vec<ScoredMemory>, MemoryError> {
            Ok(Vec::new())
        }
        async fn update(&self, _id: &str, _content: &str) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn delete(&self, _ids: &[String]) -> Result<(), MemoryError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingVector {
        inserted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorStore for RecordingVector {
        async fn insert(&self, ids: &[String], _e: &[Embedding]) -> Result<(), MemoryError> {
            self.inserted.lock().unwrap().extend(ids.iter().cloned());
            Ok(())
        }
        async fn search(
            &self,
            _embedding: &Embedding,
            _top_k: usize,
        ) -> Result<Vec<(String, f32)>, MemoryError> {
            Ok(Vec::new())
        }
        async fn contains(&self, _ids: &[String]) -> Result<Vec<String>, MemoryError> {
            Ok(self.inserted.lock().unwrap().clone())
        }
        async fn update(&self, _id: &str, _e: &Embedding) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn delete(&self, _ids: &[String]) -> Result<(), MemoryError> {
            Ok(())
        }
    }

    struct NullGraph;

    #[async_trait]
    impl GraphStore for NullGraph {
        async fn write_node(&self, _node: &GraphNode) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn write_edge(&self, _edge: &GraphEdge) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn query(&self, _query: &str) -> Result<Vec<GraphNode>, MemoryError> {
            Ok(Vec::new())
        }
    }

    struct EchoLlm;

    #[async_trait]
    impl Llm for EchoLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, MemoryError> {
            Ok("fact one\n\n  fact two  \n".into())
        }
    }

    fn ops_with_flaky_embedder(failures: u32) -> MemoryOps {
        MemoryOps::new(
            Arc::new(NullStore),
            Arc::new(FlakyEmbedder {
                failures: AtomicU32::new(failures),
            }),
            Arc::new(RecordingVector::default()),
            Arc::new(NullGraph),
            Arc::new(EchoLlm),
        )
        .with_retry_policy(
            3,
            BackoffPolicy {
                base: std::time::Duration::from_millis(1),
                multiplier: 1.0,
                cap: std::time::Duration::from_millis(1),
                jitter: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let ops = ops_with_flaky_embedder(2);
        let items = vec![MemoryItem::new("u1", "cube-1", "likes coffee")];
        let ids = ops.add_memories(items).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let ops = ops_with_flaky_embedder(5);
        let items = vec![MemoryItem::new("u1", "cube-1", "likes coffee")];
        let err = ops.add_memories(items).await.unwrap_err();
        assert!(err.is_transient(), "bounded retry must surface the transient error");
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        struct PermanentEmbedder {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Embedder for PermanentEmbedder {
            async fn embed(&self, _texts: &[String]) -> Result<Vec<Embedding>, MemoryError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::Permanent {
                    op: "embed",
                    reason: "model gone".into(),
                })
            }
        }

        let embedder = Arc::new(PermanentEmbedder {
            calls: AtomicU32::new(0),
        });
        let ops = MemoryOps::new(
            Arc::new(NullStore),
            embedder.clone(),
            Arc::new(RecordingVector::default()),
            Arc::new(NullGraph),
            Arc::new(EchoLlm),
        );

        let items = vec![MemoryItem::new("u1", "cube-1", "x")];
        assert!(ops.add_memories(items).await.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extract_memories_splits_lines() {
        let ops = ops_with_flaky_embedder(0);
        let facts = ops.extract_memories(&["hello".into()]).await.unwrap();
        assert_eq!(facts, vec!["fact one".to_string(), "fact two".to_string()]);
    }
}
