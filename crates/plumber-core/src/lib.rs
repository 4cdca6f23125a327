//! Flow execution engine and repository trait definitions for Plumber.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine that walks a flow one step at a time. It
//! depends only on `plumber-types` -- never on `plumber-infra` or any
//! database/IO crate.

pub mod engine;
pub mod repository;
