//! Triage Core Library
//!
//! Support ticket pipeline (classify, retrieve, respond, evaluate) and the
//! optimizer that searches for better stage instructions and demonstrations.

pub mod config;
pub mod dataset;
pub mod error;
pub mod lm;
pub mod optimizer;
pub mod pipeline;
pub mod primitives;
pub mod retry;
pub mod scorer;
pub mod server;
pub mod signature;
pub mod stage;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::Config;
pub use dataset::{Dataset, Example, ExampleId, ExampleSet, Expected, Pool};
pub use error::{GenerationError, LeakError, OptimizeError, PipelineError, StageError};
pub use optimizer::{OptimizationResult, Optimizer, OptimizerConfig, TerminationReason};
pub use pipeline::{Pipeline, PipelineOutput, PipelineState, Ticket};
pub use primitives::{Generator, Passage, Retriever};
pub use scorer::{Scorer, TicketScorer};
pub use stage::{Demonstration, StageConfig};
