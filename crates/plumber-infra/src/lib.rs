//! Infrastructure layer for Plumber.
//!
//! Contains implementations of the repository traits defined in `plumber-core`
//! (SQLite storage) and the `config.toml` loader.

pub mod config;
pub mod sqlite;
