//! Flow repository trait definition.
//!
//! Defines the storage interface for flows, their steps, and the connections
//! steps are bound to. The infrastructure layer (plumber-infra) implements
//! this trait with SQLite persistence.

use plumber_types::error::RepositoryError;
use plumber_types::flow::{Connection, Flow, Step};
use uuid::Uuid;

/// Repository trait for flow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait FlowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Upsert a flow (insert or replace by ID).
    fn save_flow(
        &self,
        flow: &Flow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a flow by its UUID. Soft-deleted flows are still returned; callers
    /// decide how to treat `deleted_at`.
    fn get_flow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Flow>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Upsert a step (insert or replace by ID).
    fn save_step(
        &self,
        step: &Step,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step by its UUID.
    fn get_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Step>, RepositoryError>> + Send;

    /// List all steps of a flow, ordered by position ASC.
    fn list_steps(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Step>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Upsert a connection (insert or replace by ID).
    fn save_connection(
        &self,
        connection: &Connection,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a connection by its UUID.
    fn get_connection(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Connection>, RepositoryError>> + Send;
}
