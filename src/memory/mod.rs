//! Memory store collaborators and the synchronous ops facade.

pub mod ops;
pub mod traits;

pub use ops::MemoryOps;
pub use traits::{
    Embedder, Embedding, GraphEdge, GraphNode, GraphStore, Llm, MemoryItem, MemoryStore,
    ScoredMemory, VectorStore,
};
