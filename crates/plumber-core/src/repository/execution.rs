//! Execution repository trait definition.
//!
//! Executions and their step records are append-only: the engine inserts one
//! `ExecutionStep` per invocation and never updates it afterwards.

use plumber_types::error::RepositoryError;
use plumber_types::execution::{Execution, ExecutionStep};
use uuid::Uuid;

/// Repository trait for execution records.
pub trait ExecutionRepository: Send + Sync {
    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Append an execution step record. Never overwrites an existing row.
    fn create_execution_step(
        &self,
        execution_step: &ExecutionStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step records of an execution in the order they were created.
    fn list_execution_steps(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionStep>, RepositoryError>> + Send;
}
