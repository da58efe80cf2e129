//! Ariadne core library.
//!
//! Coordinates diffs produced by parallel workers: a directory-backed bus
//! stores them by status, a multi-level detector finds conflicts between
//! them, a causal-slice verifier checks each one in isolation, and the
//! orchestrator merges verified work into a single commit.

pub mod bus;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod patch;
pub mod scheduler;
pub mod verify;

// Re-exports for convenience.
pub use bus::Bus;
pub use config::AppConfig;
pub use conflict::{ConflictDetector, ResolutionPolicy};
pub use orchestrator::{OrchestrationResult, Orchestrator, PipelineObserver};
pub use verify::CausalSliceVerifier;
