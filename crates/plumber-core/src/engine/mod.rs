//! Flow execution engine: parameter resolution, branch reconstruction,
//! retry backoff, and the per-step action processor.

pub mod action;
pub mod activation;
pub mod backoff;
pub mod branches;
pub mod processor;
pub mod toolbox;
pub mod variables;
