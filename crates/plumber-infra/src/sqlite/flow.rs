//! SQLite flow repository implementation.
//!
//! Implements `FlowRepository` from `plumber-core` for the `flows`, `steps`,
//! and `connections` tables.

use plumber_core::repository::flow::FlowRepository;
use plumber_types::error::RepositoryError;
use plumber_types::flow::{Connection, Flow, Step};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `FlowRepository`.
pub struct SqliteFlowRepository {
    pool: DatabasePool,
}

impl SqliteFlowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct FlowRow {
    id: String,
    name: String,
    active: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl FlowRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn into_flow(self) -> Result<Flow, RepositoryError> {
        Ok(Flow {
            id: parse_uuid(&self.id)?,
            name: self.name,
            active: self.active,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    flow_id: String,
    step_type: String,
    position: i64,
    app_key: Option<String>,
    key: Option<String>,
    parameters: String,
    connection_id: Option<String>,
    status: String,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            step_type: row.try_get("type")?,
            position: row.try_get("position")?,
            app_key: row.try_get("app_key")?,
            key: row.try_get("key")?,
            parameters: row.try_get("parameters")?,
            connection_id: row.try_get("connection_id")?,
            status: row.try_get("status")?,
        })
    }

    fn into_step(self) -> Result<Step, RepositoryError> {
        let position = u32::try_from(self.position)
            .map_err(|e| RepositoryError::Query(format!("invalid step position: {e}")))?;

        Ok(Step {
            id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            step_type: self.step_type.parse().map_err(RepositoryError::Query)?,
            position,
            app_key: self.app_key,
            key: self.key,
            parameters: parse_json(&self.parameters)?,
            connection_id: self.connection_id.as_deref().map(parse_uuid).transpose()?,
            status: self.status.parse().map_err(RepositoryError::Query)?,
        })
    }
}

struct ConnectionRow {
    id: String,
    app_key: String,
    data: String,
    verified: bool,
    created_at: String,
}

impl ConnectionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            app_key: row.try_get("app_key")?,
            data: row.try_get("data")?,
            verified: row.try_get("verified")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_connection(self) -> Result<Connection, RepositoryError> {
        Ok(Connection {
            id: parse_uuid(&self.id)?,
            app_key: self.app_key,
            data: parse_json(&self.data)?,
            verified: self.verified,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// FlowRepository
// ---------------------------------------------------------------------------

impl FlowRepository for SqliteFlowRepository {
    async fn save_flow(&self, flow: &Flow) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO flows (id, name, active, created_at, updated_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                active = excluded.active,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at",
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(flow.active)
        .bind(format_datetime(&flow.created_at))
        .bind(format_datetime(&flow.updated_at))
        .bind(flow.deleted_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_flow(&self, id: &Uuid) -> Result<Option<Flow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM flows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let flow_row =
                    FlowRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(flow_row.into_flow()?))
            }
            None => Ok(None),
        }
    }

    async fn save_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let parameters = to_json(&step.parameters)?;

        let result = sqlx::query(
            "INSERT INTO steps (id, flow_id, type, position, app_key, key, parameters, connection_id, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                position = excluded.position,
                app_key = excluded.app_key,
                key = excluded.key,
                parameters = excluded.parameters,
                connection_id = excluded.connection_id,
                status = excluded.status",
        )
        .bind(step.id.to_string())
        .bind(step.flow_id.to_string())
        .bind(step.step_type.to_string())
        .bind(i64::from(step.position))
        .bind(&step.app_key)
        .bind(&step.key)
        .bind(&parameters)
        .bind(step.connection_id.map(|id| id.to_string()))
        .bind(step.status.to_string())
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("FOREIGN KEY") => {
                Err(RepositoryError::Conflict(format!(
                    "step {} references a missing flow or connection",
                    step.id
                )))
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<Step>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let step_row =
                    StepRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(step_row.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, flow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE flow_id = ? ORDER BY position ASC")
            .bind(flow_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                StepRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_step()
            })
            .collect()
    }

    async fn save_connection(&self, connection: &Connection) -> Result<(), RepositoryError> {
        let data = to_json(&connection.data)?;

        sqlx::query(
            "INSERT INTO connections (id, app_key, data, verified, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                app_key = excluded.app_key,
                data = excluded.data,
                verified = excluded.verified",
        )
        .bind(connection.id.to_string())
        .bind(&connection.app_key)
        .bind(&data)
        .bind(connection.verified)
        .bind(format_datetime(&connection.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_connection(&self, id: &Uuid) -> Result<Option<Connection>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let connection_row = ConnectionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(connection_row.into_connection()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
