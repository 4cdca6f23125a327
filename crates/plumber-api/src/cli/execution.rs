//! Execution commands: process one step, run a whole flow, list variables.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use plumber_core::engine::action::{Action, ActionContext, ActionRegistry};
use plumber_core::engine::activation::check_activation_eligibility;
use plumber_core::engine::backoff::BackoffPolicy;
use plumber_core::engine::branches::extract_branches;
use plumber_core::engine::processor::{ProcessOutcome, ProcessRequest};
use plumber_core::engine::variables::extract_variables;
use plumber_core::repository::execution::ExecutionRepository;
use plumber_types::error::ActionError;
use plumber_types::execution::{Execution, ExecutionStepStatus};
use plumber_types::flow::{Flow, Step, StepType};

use super::flow::load_flow;
use crate::state::{AppState, ConcreteProcessor};

// ---------------------------------------------------------------------------
// Trigger stand-in
// ---------------------------------------------------------------------------

/// Emits a fixed payload as the trigger's output, standing in for the
/// webhook or poller that would normally fire the flow.
struct TriggerPayload(Value);

impl Action for TriggerPayload {
    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        ctx.set_output(self.0.clone());
        Ok(())
    }
}

/// Toolbox actions plus a payload emitter for the flow's trigger.
fn registry_for(steps: &[Step], payload: Value) -> ActionRegistry {
    let mut registry = ActionRegistry::with_toolbox();
    let trigger = steps
        .iter()
        .find(|s| s.step_type == StepType::Trigger)
        .and_then(|s| Some((s.app_key.as_deref()?, s.key.as_deref()?)));
    if let Some((app_key, key)) = trigger {
        registry.register(app_key, key, TriggerPayload(payload));
    }
    registry
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Process a single step of an existing execution.
pub async fn process_step(
    state: &AppState,
    request: ProcessRequest,
    json: bool,
) -> Result<()> {
    let (_, steps) = load_flow(state, &request.flow_id).await?;
    let processor = state.processor(registry_for(&steps, Value::Object(Default::default())));

    let outcome = processor.process(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    println!();
    print_outcome(&outcome, None);
    println!();
    Ok(())
}

/// Create an execution and run the flow step by step.
pub async fn run_flow(
    state: &AppState,
    flow_id: &Uuid,
    payload: &str,
    test_run: bool,
    no_wait: bool,
    json: bool,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("--payload must be valid JSON")?;
    let report = execute_flow(state, flow_id, payload, test_run, no_wait).await?;

    if json {
        let out = serde_json::json!({
            "execution_id": report.execution.id,
            "outcomes": report.outcomes.iter().map(|(o, _)| o).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!();
    println!(
        "  {} Execution {} of '{}'",
        style("▶").bold(),
        style(report.execution.id).yellow(),
        style(&report.flow.name).cyan()
    );
    println!();
    for (outcome, attempts) in &report.outcomes {
        print_outcome(outcome, Some(*attempts));
    }
    println!();
    Ok(())
}

/// What a local run did: the execution it created and one outcome (with its
/// attempt count) per step that was processed.
pub struct RunReport {
    pub flow: Flow,
    pub execution: Execution,
    pub outcomes: Vec<(ProcessOutcome, u32)>,
}

/// A taken if-then branch whose siblings must not run once it finishes.
struct TakenBranch {
    /// Index just past the taken branch's own steps.
    group_end: usize,
    /// Index just past the last sibling branch at the same depth.
    family_end: usize,
}

/// Run the flow's steps in position order against a new execution.
///
/// Failed steps are retried according to the backoff policy. A false if-then
/// skips the steps inside that branch and moves on to the next sibling. A
/// true if-then runs its branch, after which the remaining siblings at that
/// depth are skipped, so at most one branch per family runs. Any other
/// cancellation, or a failure that exhausted its retries, stops the run.
pub async fn execute_flow(
    state: &AppState,
    flow_id: &Uuid,
    payload: Value,
    test_run: bool,
    no_wait: bool,
) -> Result<RunReport> {
    let (flow, steps) = load_flow(state, flow_id).await?;
    check_activation_eligibility(&steps)
        .with_context(|| format!("flow '{}' is not runnable", flow.name))?;

    let processor = state.processor(registry_for(&steps, payload));
    let policy = state.backoff();

    let execution = Execution::new(flow.id, test_run);
    state.executions.create_execution(&execution).await?;
    tracing::info!(execution_id = %execution.id, "execution started");

    let mut outcomes: Vec<(ProcessOutcome, u32)> = Vec::new();
    let mut taken: Vec<TakenBranch> = Vec::new();
    let mut index = 0;
    loop {
        while let Some(branch) = taken.last() {
            if index < branch.group_end {
                break;
            }
            index = index.max(branch.family_end);
            taken.pop();
        }
        let Some(step) = steps.get(index) else {
            break;
        };

        let request = ProcessRequest {
            flow_id: flow.id,
            execution_id: execution.id,
            step_id: step.id,
        };
        let (outcome, attempts) = process_with_retry(&processor, request, &policy, no_wait).await?;
        let proceed = outcome.proceed_to_next_step;
        let failed = outcome.execution_step.status == ExecutionStepStatus::Failure;
        outcomes.push((outcome, attempts));

        let branch_depth = step.depth().filter(|_| step.is_if_then());
        match (branch_depth, proceed, failed) {
            (Some(depth), false, _) => {
                let skipped = extract_branches(&steps[index..], depth)
                    .first()
                    .map_or(1, |group| group.len());
                tracing::debug!(skipped, "branch not taken");
                index += skipped;
            }
            (_, false, _) | (_, true, true) => break,
            (Some(depth), true, false) => {
                let groups = extract_branches(&steps[index..], depth);
                let group_len = groups.first().map_or(1, |group| group.len());
                let family_len: usize = groups.iter().map(|group| group.len()).sum();
                tracing::debug!(depth, siblings = groups.len().saturating_sub(1), "branch taken");
                taken.push(TakenBranch {
                    group_end: index + group_len,
                    family_end: index + family_len,
                });
                index += 1;
            }
            (None, true, false) => index += 1,
        }
    }

    Ok(RunReport {
        flow,
        execution,
        outcomes,
    })
}

/// Run one step, re-invoking it after the backoff delay while it fails and
/// the policy allows another attempt.
async fn process_with_retry(
    processor: &ConcreteProcessor,
    request: ProcessRequest,
    policy: &BackoffPolicy,
    no_wait: bool,
) -> Result<(ProcessOutcome, u32)> {
    let mut attempt = 1;
    loop {
        let outcome = processor.process(request).await?;
        let retryable = outcome.execution_step.status == ExecutionStepStatus::Failure
            && outcome.proceed_to_next_step;
        if !retryable || !policy.should_retry(attempt) {
            return Ok((outcome, attempt));
        }

        let delay = policy.delay(attempt);
        tracing::warn!(
            step_id = %request.step_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "step failed, retrying"
        );
        if !no_wait {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// List the display variables produced so far by an execution.
pub async fn list_variables(
    state: &AppState,
    flow_id: &Uuid,
    execution_id: &Uuid,
    json: bool,
) -> Result<()> {
    let (_, steps) = load_flow(state, flow_id).await?;
    let Some(execution) = state.executions.get_execution(execution_id).await? else {
        bail!("execution {execution_id} not found");
    };
    if execution.flow_id != *flow_id {
        bail!("execution {execution_id} does not belong to flow {flow_id}");
    }

    let records = state.executions.list_execution_steps(execution_id).await?;
    let variables = extract_variables(&steps, &records);

    if json {
        println!("{}", serde_json::to_string_pretty(&variables)?);
        return Ok(());
    }

    if variables.is_empty() {
        println!();
        println!(
            "  {} No variables recorded for execution {}",
            style("i").blue().bold(),
            execution_id
        );
        println!();
        return Ok(());
    }

    println!();
    for step in &variables {
        println!("  {}", style(&step.name).cyan().bold());

        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Variable").fg(Color::White),
            Cell::new("Label").fg(Color::White),
            Cell::new("Value").fg(Color::White),
        ]);
        for variable in &step.output {
            table.add_row(vec![
                Cell::new(format!("{{{{{}}}}}", variable.name)),
                Cell::new(variable.label.as_deref().unwrap_or("")),
                Cell::new(truncate(&variable.value.to_string(), 60)),
            ]);
        }
        println!("{table}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &ProcessOutcome, attempts: Option<u32>) {
    let record = &outcome.execution_step;
    let marker = match (record.status, outcome.proceed_to_next_step) {
        (ExecutionStepStatus::Success, _) => style("✓").green(),
        (ExecutionStepStatus::Failure, false) => style("■").yellow(),
        (ExecutionStepStatus::Failure, true) => style("✗").red(),
    };
    let attempts = match attempts {
        Some(n) if n > 1 => format!(" after {n} attempts"),
        _ => String::new(),
    };
    println!(
        "  {marker} step {} {}{attempts}",
        style(outcome.step_id).dim(),
        record.status
    );

    let detail = match (&record.data_out, &record.error_details) {
        (_, Some(error)) => Some(error),
        (Some(data), None) => Some(data),
        (None, None) => None,
    };
    if let Some(detail) = detail {
        println!("    {}", style(truncate(&detail.to_string(), 100)).dim());
    }
    if !outcome.proceed_to_next_step {
        println!("    {}", style("flow halted by this step").yellow());
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::flow::FlowDefinition;
    use plumber_core::repository::flow::FlowRepository;
    use plumber_types::config::DEFAULT_MAX_ATTEMPTS;
    use plumber_types::flow::{IF_THEN_KEY, TOOLBOX_APP_KEY};
    use serde_json::json;
    use tempfile::TempDir;

    const BRANCHING_FLOW: &str = include_str!("../../../../demos/branching-flow.json");

    async fn test_state() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let state = AppState::init(Some(tmp.path().to_path_buf())).await.unwrap();
        (tmp, state)
    }

    async fn seed_flow(state: &AppState, definition: Value) -> Uuid {
        let definition: FlowDefinition = serde_json::from_value(definition).unwrap();
        let (flow, steps, connections) = definition.into_records();
        state.flows.save_flow(&flow).await.unwrap();
        for connection in &connections {
            state.flows.save_connection(connection).await.unwrap();
        }
        for step in &steps {
            state.flows.save_step(step).await.unwrap();
        }
        flow.id
    }

    /// Positions of the steps recorded for the run, in recording order.
    async fn recorded_positions(state: &AppState, report: &RunReport) -> Vec<u32> {
        let steps = state.flows.list_steps(&report.flow.id).await.unwrap();
        state
            .executions
            .list_execution_steps(&report.execution.id)
            .await
            .unwrap()
            .iter()
            .map(|record| {
                steps
                    .iter()
                    .find(|step| step.id == record.step_id)
                    .map(|step| step.position)
                    .unwrap()
            })
            .collect()
    }

    async fn run_branching(payload: Value) -> (TempDir, AppState, RunReport) {
        let (tmp, state) = test_state().await;
        let flow_id = seed_flow(&state, serde_json::from_str(BRANCHING_FLOW).unwrap()).await;
        let report = execute_flow(&state, &flow_id, payload, true, true).await.unwrap();
        (tmp, state, report)
    }

    #[tokio::test]
    async fn test_taken_branch_skips_sibling_branches() {
        let (_tmp, state, report) = run_branching(json!({ "amount": 150, "currency": "SGD" })).await;

        assert_eq!(recorded_positions(&state, &report).await, vec![1, 2, 3]);
        assert!(report.outcomes.iter().all(|(o, _)| o.proceed_to_next_step));
        let branch = &report.outcomes[1].0.execution_step;
        assert_eq!(
            branch.data_out,
            Some(json!({ "result": true, "branchName": "Large order" }))
        );
    }

    #[tokio::test]
    async fn test_false_branch_runs_next_sibling() {
        let (_tmp, state, report) = run_branching(json!({ "amount": 50, "currency": "SGD" })).await;

        assert_eq!(recorded_positions(&state, &report).await, vec![1, 2, 4]);
        assert!(!report.outcomes[1].0.proceed_to_next_step);
        let catch_all = &report.outcomes[2].0.execution_step;
        assert_eq!(catch_all.status, ExecutionStepStatus::Success);
        assert_eq!(
            catch_all.data_out,
            Some(json!({ "result": true, "branchName": "Everything else" }))
        );
    }

    #[tokio::test]
    async fn test_only_continue_if_stops_run() {
        let (_tmp, state, report) = run_branching(json!({ "amount": 150, "currency": "USD" })).await;

        assert_eq!(recorded_positions(&state, &report).await, vec![1, 2, 3]);
        let (last, attempts) = report.outcomes.last().unwrap();
        assert!(!last.proceed_to_next_step);
        assert_eq!(last.execution_step.status, ExecutionStepStatus::Failure);
        assert_eq!(*attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_retried_up_to_max_attempts() {
        let (_tmp, state) = test_state().await;
        let flow_id = seed_flow(
            &state,
            json!({
                "name": "Misconfigured filter",
                "steps": [
                    { "type": "trigger", "app_key": "webhook", "key": "catchRawWebhook" },
                    { "app_key": "toolbox", "key": "onlyContinueIf" }
                ]
            }),
        )
        .await;

        let report = execute_flow(&state, &flow_id, json!({}), false, true).await.unwrap();

        let max = DEFAULT_MAX_ATTEMPTS as usize;
        let mut expected = vec![1];
        expected.extend(std::iter::repeat_n(2, max));
        assert_eq!(recorded_positions(&state, &report).await, expected);

        assert_eq!(report.outcomes.len(), 2);
        let (last, attempts) = &report.outcomes[1];
        assert_eq!(*attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(last.execution_step.status, ExecutionStepStatus::Failure);
        assert!(last.proceed_to_next_step);
        assert!(!report.execution.test_run);
    }

    #[tokio::test]
    async fn test_nested_branches_run_one_per_family() {
        let (_tmp, state) = test_state().await;
        let amount_gte = |value: i64| json!([{ "field": "{{step.0.amount}}", "is": "gte", "value": value }]);
        let flow_id = seed_flow(
            &state,
            json!({
                "name": "Nested",
                "steps": [
                    { "type": "trigger", "app_key": "webhook", "key": "catchRawWebhook" },
                    { "app_key": "toolbox", "key": "ifThen",
                      "parameters": { "depth": 0, "branchName": "Outer", "conditions": amount_gte(10) } },
                    { "app_key": "toolbox", "key": "ifThen",
                      "parameters": { "depth": 1, "branchName": "Inner big", "conditions": amount_gte(1000) } },
                    { "app_key": "toolbox", "key": "onlyContinueIf",
                      "parameters": { "conditions": amount_gte(0) } },
                    { "app_key": "toolbox", "key": "ifThen",
                      "parameters": { "depth": 1, "branchName": "Inner rest" } },
                    { "app_key": "toolbox", "key": "ifThen",
                      "parameters": { "depth": 0, "branchName": "Outer rest" } }
                ]
            }),
        )
        .await;

        let report = execute_flow(&state, &flow_id, json!({ "amount": 50 }), true, true)
            .await
            .unwrap();

        assert_eq!(recorded_positions(&state, &report).await, vec![1, 2, 3, 5]);
    }

    #[tokio::test]
    async fn test_flow_without_trigger_is_not_runnable() {
        let (_tmp, state) = test_state().await;
        let flow_id = seed_flow(
            &state,
            json!({ "name": "No trigger", "steps": [{ "app_key": "toolbox", "key": "ifThen" }] }),
        )
        .await;

        let err = execute_flow(&state, &flow_id, json!({}), true, true)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not runnable"));
    }

    #[test]
    fn test_registry_for_registers_trigger() {
        let flow_id = Uuid::now_v7();
        let steps = vec![
            Step::trigger(flow_id, "webhook", "catchRawWebhook"),
            Step::action(flow_id, 2, TOOLBOX_APP_KEY, IF_THEN_KEY),
        ];
        let registry = registry_for(&steps, json!({ "a": 1 }));
        assert!(registry.contains("webhook", "catchRawWebhook"));
        assert!(registry.contains(TOOLBOX_APP_KEY, IF_THEN_KEY));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
