//! Capability handler trait, its object-safe wrapper, and the registry.
//!
//! Handlers implement [`Action`] with native async fn. [`BoxAction`] erases
//! the concrete type (blanket `ActionDyn` impl with boxed futures) so the
//! [`ActionRegistry`] can hold handlers for many apps in one table keyed by
//! `(app_key, key)`.

use std::collections::HashMap;
use std::future::Future;

use futures_util::future::BoxFuture;
use plumber_types::error::ActionError;
use plumber_types::execution::Execution;
use plumber_types::flow::{Connection, Flow, IF_THEN_KEY, ONLY_CONTINUE_IF_KEY, Step, TOOLBOX_APP_KEY};
use serde_json::Value;

use super::toolbox::{IfThen, OnlyContinueIf};

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Everything a handler may read while running one step, plus the output slot
/// it writes to.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub flow: Flow,
    /// The step being run, with parameters already resolved.
    pub step: Step,
    pub connection: Option<Connection>,
    pub execution: Execution,
    output: Option<Value>,
    output_metadata: Option<Value>,
}

impl ActionContext {
    pub fn new(flow: Flow, step: Step, connection: Option<Connection>, execution: Execution) -> Self {
        Self {
            flow,
            step,
            connection,
            execution,
            output: None,
            output_metadata: None,
        }
    }

    /// Resolved parameters of the current step.
    pub fn parameters(&self) -> &Value {
        &self.step.parameters
    }

    /// Record the handler's raw output. Later calls overwrite earlier ones.
    pub fn set_output(&mut self, output: Value) {
        self.output = Some(output);
    }

    /// Attach display metadata (labels, order, hidden flags) to the output.
    pub fn set_output_metadata(&mut self, metadata: Value) {
        self.output_metadata = Some(metadata);
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Value> {
        self.output.take()
    }

    pub fn take_output_metadata(&mut self) -> Option<Value> {
        self.output_metadata.take()
    }
}

// ---------------------------------------------------------------------------
// Action trait
// ---------------------------------------------------------------------------

/// A capability handler for one `(app_key, key)` pair.
///
/// Uses native async fn in traits (Rust 2024 edition). For dynamic dispatch,
/// wrap in [`BoxAction`].
pub trait Action: Send + Sync {
    fn run(&self, ctx: &mut ActionContext) -> impl Future<Output = Result<(), ActionError>> + Send;
}

/// Object-safe version of [`Action`] with a boxed future.
pub trait ActionDyn: Send + Sync {
    fn run_boxed<'a>(&'a self, ctx: &'a mut ActionContext) -> BoxFuture<'a, Result<(), ActionError>>;
}

impl<T: Action> ActionDyn for T {
    fn run_boxed<'a>(&'a self, ctx: &'a mut ActionContext) -> BoxFuture<'a, Result<(), ActionError>> {
        Box::pin(self.run(ctx))
    }
}

/// Type-erased capability handler.
pub struct BoxAction {
    inner: Box<dyn ActionDyn + Send + Sync>,
}

impl BoxAction {
    pub fn new<T: Action + 'static>(action: T) -> Self {
        Self {
            inner: Box::new(action),
        }
    }

    pub async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        self.inner.run_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAction").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Flat lookup table from `(app_key, key)` to handler.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<(String, String), BoxAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in toolbox actions.
    pub fn with_toolbox() -> Self {
        let mut registry = Self::new();
        registry.register(TOOLBOX_APP_KEY, ONLY_CONTINUE_IF_KEY, OnlyContinueIf);
        registry.register(TOOLBOX_APP_KEY, IF_THEN_KEY, IfThen);
        registry
    }

    /// Register a handler, replacing any previous one for the same key pair.
    pub fn register<T: Action + 'static>(&mut self, app_key: &str, key: &str, action: T) {
        self.actions
            .insert((app_key.to_string(), key.to_string()), BoxAction::new(action));
    }

    pub fn get(&self, app_key: &str, key: &str) -> Option<&BoxAction> {
        self.actions.get(&(app_key.to_string(), key.to_string()))
    }

    pub fn contains(&self, app_key: &str, key: &str) -> bool {
        self.get(app_key, key).is_some()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registered `(app_key, key)` pairs, sorted.
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.actions.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Action for Echo {
        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            let params = ctx.parameters().clone();
            ctx.set_output(json!({ "echo": params }));
            Ok(())
        }
    }

    fn context(parameters: Value) -> ActionContext {
        let flow = Flow::new("test");
        let step = Step::action(flow.id, 2, "echo", "run").with_parameters(parameters);
        let execution = Execution::new(flow.id, false);
        ActionContext::new(flow, step, None, execution)
    }

    #[tokio::test]
    async fn test_box_action_runs_inner() {
        let action = BoxAction::new(Echo);
        let mut ctx = context(json!({ "a": 1 }));
        action.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_output(), Some(json!({ "echo": { "a": 1 } })));
        assert_eq!(ctx.take_output(), None);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ActionRegistry::new();
        assert!(registry.is_empty());
        registry.register("echo", "run", Echo);
        assert!(registry.contains("echo", "run"));
        assert!(!registry.contains("echo", "other"));
        assert!(registry.get("other", "run").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_with_toolbox() {
        let registry = ActionRegistry::with_toolbox();
        assert_eq!(
            registry.keys(),
            vec![
                (TOOLBOX_APP_KEY.to_string(), IF_THEN_KEY.to_string()),
                (TOOLBOX_APP_KEY.to_string(), ONLY_CONTINUE_IF_KEY.to_string()),
            ]
        );
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ActionRegistry::new();
        registry.register("echo", "run", Echo);
        registry.register("echo", "run", Echo);
        assert_eq!(registry.len(), 1);
    }
}
