//! Application state wiring repositories and configuration together.
//!
//! The engine is generic over repository traits; AppState pins it to the
//! SQLite implementations from plumber-infra.

use std::path::PathBuf;

use plumber_core::engine::action::ActionRegistry;
use plumber_core::engine::backoff::BackoffPolicy;
use plumber_core::engine::processor::ActionProcessor;
use plumber_infra::config::{default_data_dir, ensure_data_dir, load_engine_config, resolve_database_url};
use plumber_infra::sqlite::execution::SqliteExecutionRepository;
use plumber_infra::sqlite::flow::SqliteFlowRepository;
use plumber_infra::sqlite::pool::DatabasePool;
use plumber_types::config::EngineConfig;

/// Processor pinned to the SQLite repositories.
pub type ConcreteProcessor = ActionProcessor<SqliteFlowRepository, SqliteExecutionRepository>;

/// Shared state for CLI commands.
pub struct AppState {
    pub flows: SqliteFlowRepository,
    pub executions: SqliteExecutionRepository,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Load config, open the database, and build the repositories.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        ensure_data_dir(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url).await?;

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            flows: SqliteFlowRepository::new(db_pool.clone()),
            executions: SqliteExecutionRepository::new(db_pool.clone()),
            config,
            db_pool,
        })
    }

    /// Build a processor over fresh repository handles sharing the pool.
    pub fn processor(&self, registry: ActionRegistry) -> ConcreteProcessor {
        ActionProcessor::new(
            SqliteFlowRepository::new(self.db_pool.clone()),
            SqliteExecutionRepository::new(self.db_pool.clone()),
            registry,
        )
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_config(&self.config.backoff)
    }
}
