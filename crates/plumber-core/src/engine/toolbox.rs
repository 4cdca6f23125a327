//! Built-in control-flow actions of the `toolbox` app.
//!
//! - `onlyContinueIf` halts the execution unless all conditions hold.
//! - `ifThen` guards a branch; a false branch halts that branch.
//!
//! Both halt through [`ActionError::CancelFlow`], which the processor records
//! without treating it as a defect.

use std::fmt;
use std::str::FromStr;

use plumber_types::error::ActionError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::action::{Action, ActionContext};

const TOOLBOX_APP_NAME: &str = "Toolbox";

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Comparison applied by a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    Contains,
    BeginsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    IsEmpty,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::BeginsWith => "beginsWith",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::IsEmpty => "isEmpty",
        };
        f.write_str(name)
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Operator::Equals),
            "contains" => Ok(Operator::Contains),
            "beginsWith" => Ok(Operator::BeginsWith),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Gte),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Lte),
            "isEmpty" => Ok(Operator::IsEmpty),
            other => Err(format!("invalid condition operator: '{other}'")),
        }
    }
}

/// One `{field, is, value, not}` entry of `parameters.conditions`.
#[derive(Debug, Clone, Deserialize)]
struct RawCondition {
    #[serde(default)]
    field: Value,
    #[serde(default)]
    is: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    not: bool,
}

/// A validated condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: Value,
    pub operator: Operator,
    pub value: Value,
    pub negate: bool,
}

impl Condition {
    /// Evaluate the condition. Ordering operators require numeric operands.
    pub fn evaluate(&self) -> Result<bool, String> {
        let outcome = match self.operator {
            Operator::Equals => loosely_equal(&self.field, &self.value),
            Operator::Contains => contains(&self.field, &self.value),
            Operator::BeginsWith => as_text(&self.field).starts_with(&as_text(&self.value)),
            Operator::IsEmpty => is_empty(&self.field),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let (Some(left), Some(right)) = (as_number(&self.field), as_number(&self.value)) else {
                    return Err(format!("'{}' requires numeric operands", self.operator));
                };
                match self.operator {
                    Operator::Gt => left > right,
                    Operator::Gte => left >= right,
                    Operator::Lt => left < right,
                    _ => left <= right,
                }
            }
        };
        Ok(outcome != self.negate)
    }
}

/// Parse `parameters.conditions` into validated conditions.
pub fn parse_conditions(parameters: &Value) -> Result<Vec<Condition>, String> {
    let Some(raw) = parameters.get("conditions") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawCondition> =
        serde_json::from_value(raw.clone()).map_err(|e| format!("malformed conditions: {e}"))?;

    raw.into_iter()
        .map(|c| {
            Ok(Condition {
                operator: c.is.parse()?,
                field: c.field,
                value: c.value,
                negate: c.not,
            })
        })
        .collect()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Numeric comparison when both sides are numeric, textual otherwise.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => as_text(left) == as_text(right),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        other => as_text(other).contains(&as_text(needle)),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Build the structured step error that points the author at the
/// misconfigured step.
fn step_error(name: &str, solution: &str, ctx: &ActionContext) -> ActionError {
    let details = json!({
        "error": name,
        "solution": solution,
        "position": ctx.step.position,
        "appName": TOOLBOX_APP_NAME,
    });
    ActionError::Failed(details.to_string())
}

fn evaluate_all(conditions: &[Condition], ctx: &ActionContext) -> Result<bool, ActionError> {
    for condition in conditions {
        let holds = condition.evaluate().map_err(|reason| {
            step_error(
                &format!("Invalid condition: {reason}"),
                "Click on set up action and check that the condition has been configured properly.",
                ctx,
            )
        })?;
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Halts the execution unless every configured condition holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnlyContinueIf;

impl Action for OnlyContinueIf {
    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let conditions = parse_conditions(ctx.parameters()).map_err(|reason| {
            step_error(
                &format!("Invalid condition: {reason}"),
                "Click on set up action and check that one of valid options in the condition dropdown is being selected.",
                ctx,
            )
        })?;
        if conditions.is_empty() {
            return Err(step_error(
                "No conditions configured",
                "Click on set up action and check that the condition has been configured properly.",
                ctx,
            ));
        }

        if !evaluate_all(&conditions, ctx)? {
            debug!(position = ctx.step.position, "condition not met, stopping execution");
            return Err(ActionError::CancelFlow {
                reason: "condition not met".to_string(),
            });
        }

        ctx.set_output(json!({ "result": true }));
        Ok(())
    }
}

/// Guards one if-then branch. A branch without conditions is always taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfThen;

impl Action for IfThen {
    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let conditions = parse_conditions(ctx.parameters()).map_err(|reason| {
            step_error(
                &format!("Invalid condition: {reason}"),
                "Click on set up action and check that one of valid options in the condition dropdown is being selected.",
                ctx,
            )
        })?;
        let branch_name = ctx
            .parameters()
            .get("branchName")
            .cloned()
            .unwrap_or(Value::Null);

        if !evaluate_all(&conditions, ctx)? {
            debug!(branch = %branch_name, "branch not taken");
            return Err(ActionError::CancelFlow {
                reason: format!("branch {branch_name} not taken"),
            });
        }

        ctx.set_output(json!({ "result": true, "branchName": branch_name }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
