//! # Canopy Core
//!
//! Domain types, traits, and error definitions for the Canopy conversation
//! substrate. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is a trait here: the LM backend (`Provider`), the
//! sentence embedder (`Embedder`), and the durable message archive
//! (`Archive`). Implementations live in their respective crates, so the
//! orchestration code never knows which backend it is talking to and tests
//! can substitute scripted fakes.

pub mod archive;
pub mod error;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use archive::{Archive, ArchiveFilter, ArchiveRecord, Embedder, RecordId, ScoredRecord};
pub use error::{ArchiveError, Error, ForestError, ProviderError, Result};
pub use message::{ChatMessage, ContextType, FollowUp, NodeId, Role, Turn};
pub use provider::{
    EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse, StreamChunk,
    Usage,
};
