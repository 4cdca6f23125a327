//! Shared domain types for the Plumber flow engine.
//!
//! Flows, steps, connections, executions and their outcome records, plus the
//! error and configuration types shared by the engine and its storage layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod flow;
