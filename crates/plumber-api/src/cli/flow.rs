//! Flow commands: import, show, activation check, branch grouping.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use plumber_core::engine::activation::check_activation_eligibility;
use plumber_core::engine::branches::{extract_branches, is_branch_completed};
use plumber_core::repository::flow::FlowRepository;
use plumber_types::flow::{Connection, Flow, Step, StepStatus, StepType};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Import format
// ---------------------------------------------------------------------------

/// A flow as written in an import file. Positions are assigned from the
/// order of `steps`.
#[derive(Debug, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct StepDefinition {
    #[serde(rename = "type", default = "default_step_type")]
    pub step_type: StepType,
    pub app_key: Option<String>,
    pub key: Option<String>,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default)]
    pub status: StepStatus,
    /// Credentials to store and bind to this step.
    pub connection: Option<ConnectionDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionDefinition {
    pub app_key: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn default_step_type() -> StepType {
    StepType::Action
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl FlowDefinition {
    /// Convert into domain records with fresh IDs.
    pub fn into_records(self) -> (Flow, Vec<Step>, Vec<Connection>) {
        let mut flow = Flow::new(self.name);
        flow.active = self.active;

        let mut connections = Vec::new();
        let steps = self
            .steps
            .into_iter()
            .zip(1u32..)
            .map(|(def, position)| {
                let connection_id = def.connection.map(|c| {
                    let connection = Connection::new(c.app_key, c.data);
                    let id = connection.id;
                    connections.push(connection);
                    id
                });
                Step {
                    id: Uuid::now_v7(),
                    flow_id: flow.id,
                    step_type: def.step_type,
                    position,
                    app_key: def.app_key,
                    key: def.key,
                    parameters: def.parameters,
                    connection_id,
                    status: def.status,
                }
            })
            .collect();

        (flow, steps, connections)
    }
}

#[derive(Serialize)]
struct ImportSummary {
    flow_id: Uuid,
    name: String,
    steps: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Import a flow definition file into the store.
pub async fn import_flow(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let definition: FlowDefinition = serde_json::from_str(&content)
        .with_context(|| format!("invalid flow definition in {}", file.display()))?;

    let (flow, steps, connections) = definition.into_records();
    if flow.active {
        check_activation_eligibility(&steps)
            .with_context(|| format!("flow '{}' cannot be imported as active", flow.name))?;
    }

    state.flows.save_flow(&flow).await?;
    for connection in &connections {
        state.flows.save_connection(connection).await?;
    }
    for step in &steps {
        state.flows.save_step(step).await?;
    }
    tracing::info!(flow_id = %flow.id, steps = steps.len(), "flow imported");

    if json {
        let summary = ImportSummary {
            flow_id: flow.id,
            name: flow.name.clone(),
            steps: steps.iter().map(|s| s.id).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Imported '{}' ({} steps)",
        style("✓").green().bold(),
        style(&flow.name).cyan(),
        steps.len()
    );
    println!("  Flow ID: {}", style(flow.id).yellow());
    println!();
    Ok(())
}

/// Print a flow and its steps.
pub async fn show_flow(state: &AppState, flow_id: &Uuid, json: bool) -> Result<()> {
    let (flow, steps) = load_flow(state, flow_id).await?;

    if json {
        let out = serde_json::json!({ "flow": flow, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} {}",
        style("⚙").bold(),
        style(&flow.name).cyan().bold(),
        if flow.active {
            style("● active").green()
        } else {
            style("○ inactive").dim()
        }
    );
    println!();
    println!("{}", steps_table(&steps));
    println!();
    Ok(())
}

/// Report whether the flow satisfies the activation rules.
pub async fn check_flow(state: &AppState, flow_id: &Uuid, json: bool) -> Result<()> {
    let (flow, steps) = load_flow(state, flow_id).await?;
    let result = check_activation_eligibility(&steps);

    if json {
        let out = serde_json::json!({
            "flow_id": flow.id,
            "eligible": result.is_ok(),
            "reason": result.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match result {
        Ok(()) => println!(
            "  {} '{}' can be activated",
            style("✓").green(),
            style(&flow.name).cyan()
        ),
        Err(err) => println!(
            "  {} '{}' cannot be activated: {}",
            style("✗").red(),
            style(&flow.name).cyan(),
            err
        ),
    }
    println!();
    Ok(())
}

/// Show if-then branch groups at `depth`.
pub async fn show_branches(state: &AppState, flow_id: &Uuid, depth: i64, json: bool) -> Result<()> {
    let (_, steps) = load_flow(state, flow_id).await?;

    let Some(start) = steps
        .iter()
        .position(|s| s.is_if_then() && s.depth().is_some_and(|d| d == depth))
    else {
        if json {
            println!("[]");
        } else {
            println!();
            println!(
                "  {} No if-then branches at depth {depth}",
                style("i").blue().bold()
            );
            println!();
        }
        return Ok(());
    };

    let groups = extract_branches(&steps[start..], depth);

    if json {
        let out: Vec<Value> = groups
            .iter()
            .map(|group| {
                serde_json::json!({
                    "branch_name": group[0].parameters.get("branchName"),
                    "completed": is_branch_completed(group),
                    "steps": group.iter().map(|s| s.id).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for (index, group) in groups.iter().enumerate() {
        let name = group[0]
            .parameters
            .get("branchName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Branch {}", index + 1));
        let completed = if is_branch_completed(group) {
            style("complete").green()
        } else {
            style("incomplete").yellow()
        };
        println!("  {} {} ({completed})", style("⑂").bold(), style(name).cyan());
        println!("{}", steps_table(group));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load a live flow with its steps ordered by position.
pub async fn load_flow(state: &AppState, flow_id: &Uuid) -> Result<(Flow, Vec<Step>)> {
    let Some(flow) = state.flows.get_flow(flow_id).await? else {
        bail!("flow {flow_id} not found");
    };
    if flow.is_deleted() {
        bail!("flow {flow_id} has been deleted");
    }
    let steps = state.flows.list_steps(flow_id).await?;
    Ok((flow, steps))
}

fn steps_table(steps: &[Step]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Type").fg(Color::White),
        Cell::new("App").fg(Color::White),
        Cell::new("Key").fg(Color::White),
        Cell::new("Depth").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("ID").fg(Color::White),
    ]);

    for step in steps {
        let status = match step.status {
            StepStatus::Completed => Cell::new("● completed").fg(Color::Green),
            StepStatus::Incomplete => Cell::new("○ incomplete").fg(Color::Yellow),
        };
        let depth = step
            .depth()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(step.position),
            Cell::new(step.step_type),
            Cell::new(step.app_key.as_deref().unwrap_or("-")),
            Cell::new(step.key.as_deref().unwrap_or("-")),
            Cell::new(depth),
            status,
            Cell::new(step.id).fg(Color::DarkGrey),
        ]);
    }
    table
}
