//! Conversation tree substrate for Canopy.
//!
//! One `Node` per conversation branch, each owning a bounded `MessageBuffer`
//! of recent turns plus a rolling summary. The `Forest` is the registry of
//! all nodes and trees; the `RollingSummarizer` periodically folds a node's
//! oldest turns into its summary.

pub mod buffer;
pub mod forest;
pub mod node;
pub mod summarizer;

pub use buffer::MessageBuffer;
pub use forest::Forest;
pub use node::Node;
pub use summarizer::RollingSummarizer;
