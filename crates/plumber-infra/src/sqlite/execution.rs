//! SQLite execution repository implementation.
//!
//! `execution_steps` is append-only. Rows are listed by `created_at`, with
//! the insertion rowid breaking ties between records created in the same
//! microsecond.

use plumber_core::repository::execution::ExecutionRepository;
use plumber_types::error::RepositoryError;
use plumber_types::execution::{Execution, ExecutionStep};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ExecutionRow {
    id: String,
    flow_id: String,
    test_run: bool,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            test_run: row.try_get("test_run")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            test_run: self.test_run,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct ExecutionStepRow {
    id: String,
    execution_id: String,
    step_id: String,
    status: String,
    data_in: String,
    data_out: Option<String>,
    data_out_metadata: Option<String>,
    error_details: Option<String>,
    created_at: String,
}

impl ExecutionStepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            data_in: row.try_get("data_in")?,
            data_out: row.try_get("data_out")?,
            data_out_metadata: row.try_get("data_out_metadata")?,
            error_details: row.try_get("error_details")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_execution_step(self) -> Result<ExecutionStep, RepositoryError> {
        Ok(ExecutionStep {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: parse_uuid(&self.step_id)?,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            data_in: parse_json(&self.data_in)?,
            data_out: self.data_out.as_deref().map(parse_json).transpose()?,
            data_out_metadata: self.data_out_metadata.as_deref().map(parse_json).transpose()?,
            error_details: self.error_details.as_deref().map(parse_json).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO executions (id, flow_id, test_run, created_at) VALUES (?, ?, ?, ?)")
            .bind(execution.id.to_string())
            .bind(execution.flow_id.to_string())
            .bind(execution.test_run)
            .bind(format_datetime(&execution.created_at))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let execution_row = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(execution_row.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn create_execution_step(&self, execution_step: &ExecutionStep) -> Result<(), RepositoryError> {
        let data_in = to_json(&execution_step.data_in)?;
        let data_out = execution_step.data_out.as_ref().map(to_json).transpose()?;
        let data_out_metadata = execution_step
            .data_out_metadata
            .as_ref()
            .map(to_json)
            .transpose()?;
        let error_details = execution_step.error_details.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            "INSERT INTO execution_steps (id, execution_id, step_id, status, data_in, data_out, data_out_metadata, error_details, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution_step.id.to_string())
        .bind(execution_step.execution_id.to_string())
        .bind(execution_step.step_id.to_string())
        .bind(execution_step.status.to_string())
        .bind(&data_in)
        .bind(&data_out)
        .bind(&data_out_metadata)
        .bind(&error_details)
        .bind(format_datetime(&execution_step.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::Conflict(format!(
                    "execution step {} already recorded",
                    execution_step.id
                )))
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn list_execution_steps(&self, execution_id: &Uuid) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                ExecutionStepRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_execution_step()
            })
            .collect()
    }
}
