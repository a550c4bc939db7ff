//! # agent-memory
//!
//! Layered memory for agents.
//!
//! ```text
//! MemoryTool / RagTool
//!         │
//!   MemoryManager ── classify · importance · consolidate
//!         │
//!   ┌─────┴──────┬──────────────┬──────────────┐
//! Working     Episodic       Semantic      Perceptual
//! (TTL, tokens)  └── InMemoryStore or QdrantStore ──┘
//! ```
//!
//! Every layer sits behind the [`MemoryStore`] trait, so the in-process
//! stores can be swapped for the Qdrant backend per layer. [`ContextBuilder`]
//! turns memories, knowledge-base hits and recent conversation into a
//! budgeted prompt context.

pub mod context;
pub mod embedding;
pub mod error;
pub mod manager;
pub mod model;
pub mod rag;
pub mod store;
pub mod tool;

pub use context::{ContextBuilder, ContextConfig, ContextPacket, PacketKind};
pub use embedding::{Embedder, EmbedderConfig, OpenAiEmbedder};
pub use error::{MemoryError, Result};
pub use manager::{ManagerStats, MemoryManager, NewMemory};
pub use model::{MemoryConfig, MemoryItem, MemoryKind, Metadata};
pub use rag::RagTool;
pub use store::{
    Distance, ForgetStrategy, InMemoryStore, MemoryStore, MemoryUpdate, QdrantConfig, QdrantStore,
    RetrieveQuery, StoreStats, WorkingMemory,
};
pub use tool::MemoryTool;
