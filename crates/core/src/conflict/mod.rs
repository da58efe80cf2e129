//! Conflict detection and resolution policy.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- pairwise analysis of diffs at file, delete/modify,
//!    line and (optionally) causal granularity.
//! 2. **Resolution** -- an injectable policy choosing a merge strategy for
//!    each detected conflict.

pub mod detector;
pub mod resolver;

pub use detector::{
    check_causal_conflict, ConflictAnalysis, ConflictDetector, ConflictSeverity, LINE_BUFFER,
};
pub use resolver::{DefaultResolutionPolicy, FnPolicy, ResolutionPolicy};
