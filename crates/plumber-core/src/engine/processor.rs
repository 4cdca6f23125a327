//! Action processor: runs exactly one step of one execution.
//!
//! Given `(flow_id, execution_id, step_id)` the processor loads the step and
//! its surroundings, resolves variable tokens against earlier step outputs,
//! dispatches to the registered handler, and appends one immutable
//! `ExecutionStep` describing the outcome. Scheduling and retries belong to
//! the caller; see [`super::backoff::BackoffPolicy`] for retry delays.

use chrono::Utc;
use plumber_types::error::{ActionError, RepositoryError};
use plumber_types::execution::{Execution, ExecutionStep, ExecutionStepStatus};
use plumber_types::flow::{Connection, Flow, Step};
use serde::Serialize;
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::repository::execution::ExecutionRepository;
use crate::repository::flow::FlowRepository;

use super::action::{ActionContext, ActionRegistry, BoxAction};
use super::variables::compute_parameters;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// One invocation of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessRequest {
    pub flow_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
}

/// Result of one invocation, returned to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub flow_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    /// The record written for this invocation.
    pub execution_step: ExecutionStep,
    /// `false` only when the handler cancelled the flow.
    pub proceed_to_next_step: bool,
}

/// Invocation-level faults. Handler failures never surface here; they are
/// recorded on the execution step instead.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ProcessError {
    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ProcessError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionProcessor
// ---------------------------------------------------------------------------

/// Runs flow steps against the registered capability handlers.
///
/// Generic over the repository traits so plumber-core never depends on
/// plumber-infra.
pub struct ActionProcessor<F: FlowRepository, E: ExecutionRepository> {
    flows: F,
    executions: E,
    registry: ActionRegistry,
}

impl<F: FlowRepository, E: ExecutionRepository> ActionProcessor<F, E> {
    pub fn new(flows: F, executions: E, registry: ActionRegistry) -> Self {
        Self {
            flows,
            executions,
            registry,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Process one step of one execution.
    ///
    /// Writes exactly one `ExecutionStep` once the step and its execution are
    /// loaded. Missing entities abort before anything is written.
    pub async fn process(&self, request: ProcessRequest) -> Result<ProcessOutcome, ProcessError> {
        let span = info_span!(
            "process_step",
            flow_id = %request.flow_id,
            execution_id = %request.execution_id,
            step_id = %request.step_id,
        );
        self.process_inner(request).instrument(span).await
    }

    async fn process_inner(&self, request: ProcessRequest) -> Result<ProcessOutcome, ProcessError> {
        let loaded = self.load(&request).await?;
        let Loaded {
            flow,
            step,
            execution,
            connection,
            handler,
        } = loaded;

        let prior = self.executions.list_execution_steps(&execution.id).await?;
        let parameters = compute_parameters(&step.parameters, &prior);
        debug!(prior_steps = prior.len(), "parameters resolved");

        let step_id = step.id;
        let resolved_step = Step {
            parameters: parameters.clone(),
            ..step
        };
        let mut ctx = ActionContext::new(flow, resolved_step, connection, execution);

        debug!(
            app_key = ctx.step.app_key.as_deref().unwrap_or_default(),
            key = ctx.step.key.as_deref().unwrap_or_default(),
            "dispatching handler"
        );
        let result = handler.run(&mut ctx).await;

        let mut proceed_to_next_step = true;
        let (status, data_out, data_out_metadata, error_details) = match result {
            Ok(()) => (
                ExecutionStepStatus::Success,
                ctx.take_output(),
                ctx.take_output_metadata(),
                None,
            ),
            Err(err) => {
                if let ActionError::CancelFlow { reason } = &err {
                    info!(%reason, "flow cancelled by step");
                    proceed_to_next_step = false;
                } else {
                    warn!(error = %err, "step failed");
                }
                (ExecutionStepStatus::Failure, None, None, Some(err.into_details()))
            }
        };

        let execution_step = ExecutionStep {
            id: Uuid::now_v7(),
            execution_id: ctx.execution.id,
            step_id,
            status,
            data_in: parameters,
            data_out,
            data_out_metadata,
            error_details,
            created_at: Utc::now(),
        };
        self.executions.create_execution_step(&execution_step).await?;

        info!(status = %execution_step.status, proceed_to_next_step, "step processed");

        Ok(ProcessOutcome {
            flow_id: request.flow_id,
            execution_id: request.execution_id,
            step_id: request.step_id,
            execution_step,
            proceed_to_next_step,
        })
    }

    /// Load step, execution, flow, connection, and handler, in that order.
    async fn load(&self, request: &ProcessRequest) -> Result<Loaded<'_>, ProcessError> {
        let step = self
            .flows
            .get_step(&request.step_id)
            .await?
            .filter(|step| step.flow_id == request.flow_id)
            .ok_or_else(|| ProcessError::not_found("step", request.step_id))?;

        let execution = self
            .executions
            .get_execution(&request.execution_id)
            .await?
            .filter(|execution| execution.flow_id == request.flow_id)
            .ok_or_else(|| ProcessError::not_found("execution", request.execution_id))?;

        let flow = self
            .flows
            .get_flow(&request.flow_id)
            .await?
            .filter(|flow| !flow.is_deleted())
            .ok_or_else(|| ProcessError::not_found("flow", request.flow_id))?;

        let connection = match step.connection_id {
            Some(connection_id) => Some(
                self.flows
                    .get_connection(&connection_id)
                    .await?
                    .ok_or_else(|| ProcessError::not_found("connection", connection_id))?,
            ),
            None => None,
        };

        let app_key = step.app_key.as_deref().unwrap_or_default();
        let key = step.key.as_deref().unwrap_or_default();
        let handler = self
            .registry
            .get(app_key, key)
            .ok_or_else(|| ProcessError::not_found("action", format!("{app_key}.{key}")))?;

        Ok(Loaded {
            flow,
            step,
            execution,
            connection,
            handler,
        })
    }
}

struct Loaded<'a> {
    flow: Flow,
    step: Step,
    execution: Execution,
    connection: Option<Connection>,
    handler: &'a BoxAction,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use crate::engine::action::Action;
    use plumber_types::flow::{IF_THEN_KEY, ONLY_CONTINUE_IF_KEY, StepStatus, TOOLBOX_APP_KEY};

    // --- In-memory repositories ---

    #[derive(Default)]
    struct MockFlowRepository {
        flows: Mutex<HashMap<Uuid, Flow>>,
        steps: Mutex<HashMap<Uuid, Step>>,
        connections: Mutex<HashMap<Uuid, Connection>>,
    }

    impl FlowRepository for MockFlowRepository {
        async fn save_flow(&self, flow: &Flow) -> Result<(), RepositoryError> {
            self.flows.lock().unwrap().insert(flow.id, flow.clone());
            Ok(())
        }

        async fn get_flow(&self, id: &Uuid) -> Result<Option<Flow>, RepositoryError> {
            Ok(self.flows.lock().unwrap().get(id).cloned())
        }

        async fn save_step(&self, step: &Step) -> Result<(), RepositoryError> {
            self.steps.lock().unwrap().insert(step.id, step.clone());
            Ok(())
        }

        async fn get_step(&self, id: &Uuid) -> Result<Option<Step>, RepositoryError> {
            Ok(self.steps.lock().unwrap().get(id).cloned())
        }

        async fn list_steps(&self, flow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
            let mut steps: Vec<Step> = self
                .steps
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.flow_id == *flow_id)
                .cloned()
                .collect();
            steps.sort_by_key(|s| s.position);
            Ok(steps)
        }

        async fn save_connection(&self, connection: &Connection) -> Result<(), RepositoryError> {
            self.connections
                .lock()
                .unwrap()
                .insert(connection.id, connection.clone());
            Ok(())
        }

        async fn get_connection(&self, id: &Uuid) -> Result<Option<Connection>, RepositoryError> {
            Ok(self.connections.lock().unwrap().get(id).cloned())
        }
    }

    #[derive(Default)]
    struct MockExecutionRepository {
        executions: Mutex<HashMap<Uuid, Execution>>,
        steps: Mutex<Vec<ExecutionStep>>,
        fail_writes: bool,
    }

    impl ExecutionRepository for MockExecutionRepository {
        async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
            self.executions
                .lock()
                .unwrap()
                .insert(execution.id, execution.clone());
            Ok(())
        }

        async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
            Ok(self.executions.lock().unwrap().get(id).cloned())
        }

        async fn create_execution_step(&self, execution_step: &ExecutionStep) -> Result<(), RepositoryError> {
            if self.fail_writes {
                return Err(RepositoryError::Query("disk I/O error".to_string()));
            }
            self.steps.lock().unwrap().push(execution_step.clone());
            Ok(())
        }

        async fn list_execution_steps(&self, execution_id: &Uuid) -> Result<Vec<ExecutionStep>, RepositoryError> {
            Ok(self
                .steps
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.execution_id == *execution_id)
                .cloned()
                .collect())
        }
    }

    // --- Test handlers ---

    /// Returns its resolved parameters as output.
    struct Echo;

    impl Action for Echo {
        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            let output = json!({ "received": ctx.parameters().clone() });
            ctx.set_output(output);
            ctx.set_output_metadata(json!({ "received": { "label": "Received" } }));
            Ok(())
        }
    }

    /// Outputs a fixed value.
    struct Emit(Value);

    impl Action for Emit {
        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            ctx.set_output(self.0.clone());
            Ok(())
        }
    }

    /// Fails with a fixed error.
    struct Fail(fn() -> ActionError);

    impl Action for Fail {
        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            ctx.set_output(json!({ "partial": true }));
            Err((self.0)())
        }
    }

    /// Reports the connection it received.
    struct NeedsConnection;

    impl Action for NeedsConnection {
        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            let connection = ctx
                .connection
                .as_ref()
                .ok_or_else(|| ActionError::Failed("missing connection".to_string()))?;
            let token = connection.data["token"].clone();
            ctx.set_output(json!({ "token": token }));
            Ok(())
        }
    }

    // --- Fixture ---

    struct Fixture {
        flow: Flow,
        trigger: Step,
        execution: Execution,
    }

    async fn fixture(flows: &MockFlowRepository, executions: &MockExecutionRepository) -> Fixture {
        let flow = Flow::new("test flow");
        flows.save_flow(&flow).await.unwrap();
        let trigger = Step::trigger(flow.id, "webhook", "catchRawWebhook");
        flows.save_step(&trigger).await.unwrap();
        let execution = Execution::new(flow.id, false);
        executions.create_execution(&execution).await.unwrap();
        Fixture {
            flow,
            trigger,
            execution,
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::with_toolbox();
        registry.register("test", "echo", Echo);
        registry.register("webhook", "catchRawWebhook", Emit(json!({ "amount": 42 })));
        registry.register("test", "http", Fail(|| ActionError::Http {
            details: json!({ "status": 502, "message": "bad gateway" }),
        }));
        registry.register("test", "generic", Fail(|| ActionError::Failed("timeout".to_string())));
        registry.register("test", "jsonError", Fail(|| {
            ActionError::Failed(r#"{"code":"E_LIMIT","retryable":true}"#.to_string())
        }));
        registry.register("test", "cancel", Fail(|| ActionError::CancelFlow {
            reason: "stop".to_string(),
        }));
        registry.register("test", "connected", NeedsConnection);
        registry
    }

    fn request(fx: &Fixture, step: &Step) -> ProcessRequest {
        ProcessRequest {
            flow_id: fx.flow.id,
            execution_id: fx.execution.id,
            step_id: step.id,
        }
    }

    async fn processor_with_step(
        app_key: &str,
        key: &str,
        parameters: Value,
    ) -> (ActionProcessor<MockFlowRepository, MockExecutionRepository>, Fixture, Step) {
        let flows = MockFlowRepository::default();
        let executions = MockExecutionRepository::default();
        let fx = fixture(&flows, &executions).await;
        let step = Step::action(fx.flow.id, 2, app_key, key).with_parameters(parameters);
        flows.save_step(&step).await.unwrap();
        (ActionProcessor::new(flows, executions, registry()), fx, step)
    }

    // --- Tests ---

    #[tokio::test]
    async fn test_resolves_prior_outputs() {
        let (processor, fx, step) = processor_with_step("test", "echo", json!({})).await;
        let trigger_outcome = processor.process(request(&fx, &fx.trigger)).await.unwrap();
        assert!(trigger_outcome.execution_step.is_success());

        let t = fx.trigger.id;
        let step = Step {
            parameters: json!({
                "text": format!("total is {{{{step.{t}.amount}}}}"),
                "amount": format!("{{{{step.{t}.amount}}}}"),
            }),
            ..step
        };
        processor.flows.save_step(&step).await.unwrap();

        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        let record = &outcome.execution_step;
        assert_eq!(record.status, ExecutionStepStatus::Success);
        assert_eq!(record.data_in, json!({ "text": "total is 42", "amount": 42 }));
        assert_eq!(record.data_out.as_ref().unwrap()["received"]["amount"], json!(42));
        assert_eq!(record.data_out_metadata, Some(json!({ "received": { "label": "Received" } })));
        assert!(record.error_details.is_none());
        assert!(outcome.proceed_to_next_step);
    }

    #[tokio::test]
    async fn test_cancel_writes_one_row_and_stops() {
        let (processor, fx, step) = processor_with_step("test", "cancel", json!({})).await;
        let outcome = processor.process(request(&fx, &step)).await.unwrap();

        assert!(!outcome.proceed_to_next_step);
        assert_eq!(outcome.execution_step.status, ExecutionStepStatus::Failure);
        assert_eq!(outcome.execution_step.error_details.as_ref().unwrap()["cancelled"], json!(true));
        assert_eq!(processor.executions.steps.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_details_verbatim() {
        let (processor, fx, step) = processor_with_step("test", "http", json!({})).await;
        let outcome = processor.process(request(&fx, &step)).await.unwrap();

        let record = &outcome.execution_step;
        assert_eq!(record.status, ExecutionStepStatus::Failure);
        assert_eq!(record.data_out, None);
        assert_eq!(record.error_details, Some(json!({ "status": 502, "message": "bad gateway" })));
        assert!(outcome.proceed_to_next_step);
    }

    #[tokio::test]
    async fn test_generic_errors_classified() {
        let (processor, fx, step) = processor_with_step("test", "generic", json!({})).await;
        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        assert_eq!(outcome.execution_step.error_details, Some(json!({ "error": "timeout" })));

        let (processor, fx, step) = processor_with_step("test", "jsonError", json!({})).await;
        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        assert_eq!(
            outcome.execution_step.error_details,
            Some(json!({ "code": "E_LIMIT", "retryable": true }))
        );
    }

    #[tokio::test]
    async fn test_missing_entities_write_nothing() {
        let (processor, fx, step) = processor_with_step("test", "echo", json!({})).await;

        let err = processor
            .process(ProcessRequest {
                step_id: Uuid::now_v7(),
                ..request(&fx, &step)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { entity: "step", .. }));

        let err = processor
            .process(ProcessRequest {
                execution_id: Uuid::now_v7(),
                ..request(&fx, &step)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { entity: "execution", .. }));

        assert!(processor.executions.steps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_from_other_flow_not_found() {
        let (processor, fx, _) = processor_with_step("test", "echo", json!({})).await;
        let foreign = Step::action(Uuid::now_v7(), 2, "test", "echo");
        processor.flows.save_step(&foreign).await.unwrap();

        let err = processor.process(request(&fx, &foreign)).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { entity: "step", .. }));
    }

    #[tokio::test]
    async fn test_deleted_flow_not_found() {
        let (processor, fx, step) = processor_with_step("test", "echo", json!({})).await;
        let mut deleted = fx.flow.clone();
        deleted.deleted_at = Some(Utc::now());
        processor.flows.save_flow(&deleted).await.unwrap();

        let err = processor.process(request(&fx, &step)).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { entity: "flow", .. }));
    }

    #[tokio::test]
    async fn test_unregistered_action_not_found() {
        let (processor, fx, step) = processor_with_step("github", "createIssue", json!({})).await;
        let err = processor.process(request(&fx, &step)).await.unwrap_err();
        match err {
            ProcessError::NotFound { entity, id } => {
                assert_eq!(entity, "action");
                assert_eq!(id, "github.createIssue");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_passed_to_handler() {
        let (processor, fx, step) = processor_with_step("test", "connected", json!({})).await;
        let connection = Connection::new("test", json!({ "token": "abc" }));
        processor.flows.save_connection(&connection).await.unwrap();
        let step = Step {
            connection_id: Some(connection.id),
            ..step
        };
        processor.flows.save_step(&step).await.unwrap();

        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        assert_eq!(outcome.execution_step.data_out, Some(json!({ "token": "abc" })));

        let dangling = Step {
            connection_id: Some(Uuid::now_v7()),
            ..step
        };
        processor.flows.save_step(&dangling).await.unwrap();
        let err = processor.process(request(&fx, &dangling)).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { entity: "connection", .. }));
    }

    #[tokio::test]
    async fn test_retry_appends_new_row() {
        let (processor, fx, step) = processor_with_step("test", "generic", json!({})).await;
        processor.process(request(&fx, &step)).await.unwrap();
        processor.process(request(&fx, &step)).await.unwrap();

        let rows = processor.executions.steps.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].id, rows[1].id);
        assert!(rows.iter().all(|r| r.step_id == step.id));
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let flows = MockFlowRepository::default();
        let executions = MockExecutionRepository {
            fail_writes: true,
            ..Default::default()
        };
        let fx = fixture(&flows, &executions).await;
        let step = Step::action(fx.flow.id, 2, "test", "echo");
        flows.save_step(&step).await.unwrap();
        let processor = ActionProcessor::new(flows, executions, registry());

        let err = processor.process(request(&fx, &step)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Repository(RepositoryError::Query(_))));
    }

    #[tokio::test]
    async fn test_only_continue_if_halts_flow() {
        let (processor, fx, step) = processor_with_step(
            TOOLBOX_APP_KEY,
            ONLY_CONTINUE_IF_KEY,
            json!({ "conditions": [{ "field": "a", "is": "equals", "value": "b" }] }),
        )
        .await;
        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        assert!(!outcome.proceed_to_next_step);
        assert_eq!(outcome.execution_step.status, ExecutionStepStatus::Failure);
    }

    #[tokio::test]
    async fn test_if_then_branch_taken_on_resolved_condition() {
        let (processor, fx, step) = processor_with_step(TOOLBOX_APP_KEY, IF_THEN_KEY, json!({})).await;
        processor.process(request(&fx, &fx.trigger)).await.unwrap();

        let t = fx.trigger.id;
        let step = Step {
            parameters: json!({
                "depth": 0,
                "branchName": "Branch 1",
                "conditions": [{ "field": format!("{{{{step.{t}.amount}}}}"), "is": "gt", "value": 40 }],
            }),
            status: StepStatus::Completed,
            ..step
        };
        processor.flows.save_step(&step).await.unwrap();

        let outcome = processor.process(request(&fx, &step)).await.unwrap();
        assert!(outcome.proceed_to_next_step);
        assert_eq!(
            outcome.execution_step.data_out,
            Some(json!({ "result": true, "branchName": "Branch 1" }))
        );
    }
}
