//! Execution tracking types.
//!
//! An `Execution` is one run of a flow. Each step invocation appends exactly
//! one immutable `ExecutionStep`; retries append further rows for the same
//! step rather than updating the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// One run of a flow, created when its trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub flow_id: Uuid,
    /// Test runs are started from the editor to capture sample outputs.
    #[serde(default)]
    pub test_run: bool,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(flow_id: Uuid, test_run: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id,
            test_run,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStepStatus {
    Success,
    Failure,
}

impl fmt::Display for ExecutionStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStepStatus::Success => write!(f, "success"),
            ExecutionStepStatus::Failure => write!(f, "failure"),
        }
    }
}

impl FromStr for ExecutionStepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStepStatus::Success),
            "failure" => Ok(ExecutionStepStatus::Failure),
            other => Err(format!("invalid execution step status: '{other}'")),
        }
    }
}

/// Immutable record of one step's outcome within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub status: ExecutionStepStatus,
    /// Resolved parameters actually passed to the handler.
    pub data_in: Value,
    /// Raw handler output; `None` on failure.
    #[serde(default)]
    pub data_out: Option<Value>,
    /// Display metadata mirroring the shape of `data_out`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_out_metadata: Option<Value>,
    /// Structured error payload; `None` on success.
    #[serde(default)]
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStepStatus::Success
    }
}

/// Display metadata for one leaf of a step's output.
///
/// Only affects variable listings shown to authors; hidden leaves remain
/// substitutable in parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOutMetadatum {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub order: Option<i64>,
}
