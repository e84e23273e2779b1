//! Archive retrieval for Canopy.
//!
//! Two stages: the `QueryDecomposer` turns one vague user query into 5–7
//! targeted sub-queries guided by intent classification, and the
//! `ContextWindowRetriever` runs them against the archive, merges the hits,
//! and expands each into its temporal neighborhood.

pub mod decomposer;
pub mod retriever;

pub use decomposer::{DecomposedQuery, QueryDecomposer, QueryIntent};
pub use retriever::ContextWindowRetriever;
