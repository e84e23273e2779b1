//! Chat orchestration for Canopy.
//!
//! `assemble_context` builds the exact message list handed to the LM each
//! turn; `ChatOrchestrator` runs the turn end to end: append, index,
//! retrieve, assemble, stream, summarize, title.

pub mod assembler;
pub mod metrics;
pub mod orchestrator;
pub mod stream_event;

pub use assembler::{assemble_context, AssemblyInput, ARCHIVE_MEMORY_LABEL};
pub use metrics::TurnMetrics;
pub use orchestrator::{ChatOrchestrator, OrchestratorOptions, TurnOutcome};
pub use stream_event::ChatStreamEvent;
