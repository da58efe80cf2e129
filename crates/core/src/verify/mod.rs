//! Causal-slice verification.
//!
//! 1. **Workspace** -- copy the repository to a scratch directory and apply
//!    the patch there.
//! 2. **Scope** -- resolve the modules and tests the diff affects.
//! 3. **Checks** -- run type-check, lint and tests over that scope only,
//!    each under its own time bound.

pub mod checks;
pub mod scope;
pub mod verifier;
pub mod workspace;

pub use checks::{parse_test_counts, CheckCommand, CheckRun};
pub use scope::{added_definitions, extract_causal_chain, ScopeRules};
pub use verifier::CausalSliceVerifier;
pub use workspace::ScratchWorkspace;
