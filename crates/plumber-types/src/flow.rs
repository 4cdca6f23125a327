//! Flow, Step, and Connection domain types.
//!
//! A `Flow` owns an ordered list of `Step`s (one trigger followed by actions).
//! Nested if-then branches are not stored as a tree: control steps carry a
//! `depth` integer in their parameters and the tree is reconstructed from the
//! flat, position-ordered list on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// App key of the built-in toolbox app (control-flow actions).
pub const TOOLBOX_APP_KEY: &str = "toolbox";

/// Action key of the if-then branch control step.
pub const IF_THEN_KEY: &str = "ifThen";

/// Action key of the "only continue if" gate.
pub const ONLY_CONTINUE_IF_KEY: &str = "onlyContinueIf";

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// An automation definition: one trigger plus an ordered list of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    /// Whether the trigger is live.
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Flows are never hard-deleted while executions
    /// reference them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Flow {
    /// Create a new, inactive flow.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            active: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Whether a step starts the flow or performs work within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Trigger,
    Action,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Trigger => write!(f, "trigger"),
            StepType::Action => write!(f, "action"),
        }
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(StepType::Trigger),
            "action" => Ok(StepType::Action),
            other => Err(format!("invalid step type: '{other}'")),
        }
    }
}

/// Authoring status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Incomplete,
    Completed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Incomplete => write!(f, "incomplete"),
            StepStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(StepStatus::Incomplete),
            "completed" => Ok(StepStatus::Completed),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// One node of a flow, bound to an app capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub flow_id: Uuid,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// 1-based position; the trigger is always at position 1.
    pub position: u32,
    /// App identifier (e.g. "github", "toolbox"). `None` until chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    /// Capability identifier within the app (e.g. "createIssue").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Parameter object; string values may contain `{{step.<ref>.<path>}}` tokens.
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    #[serde(default)]
    pub status: StepStatus,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Step {
    /// Create an action step with empty parameters.
    pub fn action(flow_id: Uuid, position: u32, app_key: &str, key: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id,
            step_type: StepType::Action,
            position,
            app_key: Some(app_key.to_string()),
            key: Some(key.to_string()),
            parameters: empty_object(),
            connection_id: None,
            status: StepStatus::Incomplete,
        }
    }

    /// Create the trigger step (always position 1).
    pub fn trigger(flow_id: Uuid, app_key: &str, key: &str) -> Self {
        Self {
            step_type: StepType::Trigger,
            ..Self::action(flow_id, 1, app_key, key)
        }
    }

    /// Builder-style parameter setter.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Builder-style status setter.
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this step is an if-then branch control step.
    pub fn is_if_then(&self) -> bool {
        self.app_key.as_deref() == Some(TOOLBOX_APP_KEY) && self.key.as_deref() == Some(IF_THEN_KEY)
    }

    /// Nesting depth of a control step, read from `parameters.depth`.
    ///
    /// Returns `None` when the depth is absent or not numeric, which marks a
    /// freshly created nested branch whose depth has not been persisted yet.
    pub fn depth(&self) -> Option<i64> {
        self.parameters.get("depth").and_then(parse_depth)
    }
}

/// Parse a depth value with `parseInt`-like leniency: integer JSON numbers,
/// floats (truncated), and strings with a leading integer (`"2"`, `" 3px"`).
pub fn parse_depth(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => parse_leading_int(s),
        _ => None,
    }
}

fn parse_leading_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1, &trimmed[1..]),
        Some(b'+') => (1, &trimmed[1..]),
        _ => (1, trimmed),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Stored credentials for an app, handed opaquely to capability handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub app_key: String,
    /// Provider-specific credential payload.
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(app_key: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            app_key: app_key.into(),
            data,
            verified: false,
            created_at: Utc::now(),
        }
    }
}
