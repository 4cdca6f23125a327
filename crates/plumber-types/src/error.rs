use serde_json::{Value, json};
use thiserror::Error;

/// Failures raised by a capability handler while running a step.
///
/// The action processor maps each variant to the `error_details` recorded on
/// the execution step and to the continuation decision.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The handler's outbound call failed with a structured response.
    #[error("upstream request failed: {details}")]
    Http { details: Value },

    /// Deliberate early exit (e.g. a condition evaluated to false).
    #[error("flow cancelled: {reason}")]
    CancelFlow { reason: String },

    /// Any other failure. The message may itself be a JSON document.
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn is_cancel_flow(&self) -> bool {
        matches!(self, ActionError::CancelFlow { .. })
    }

    /// Convert the failure into the payload stored in `error_details`.
    ///
    /// Generic messages are parsed as JSON when possible so that handlers can
    /// encode structured detail in a string; anything else is wrapped as
    /// `{"error": message}`.
    pub fn into_details(self) -> Value {
        match self {
            ActionError::Http { details } => details,
            ActionError::CancelFlow { reason } => json!({ "cancelled": true, "reason": reason }),
            ActionError::Failed(message) => match serde_json::from_str::<Value>(&message) {
                Ok(parsed) if !parsed.is_null() => parsed,
                _ => json!({ "error": message }),
            },
        }
    }
}

/// Errors related to flow structure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow has no steps")]
    Empty,

    #[error("first step must be a trigger at position 1")]
    MissingTrigger,

    #[error("only the first step may be a trigger (found trigger at position {0})")]
    MisplacedTrigger(u32),

    #[error("flow needs at least one action step")]
    NoActions,
}

/// Errors from repository operations (used by trait definitions in plumber-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_details_verbatim() {
        let details = json!({ "status": 429, "body": { "code": "rate_limit" } });
        let err = ActionError::Http { details: details.clone() };
        assert_eq!(err.into_details(), details);
    }

    #[test]
    fn test_generic_json_message_parsed() {
        let err = ActionError::Failed(r#"{"code":"invalid_template","message":"bad"}"#.to_string());
        assert_eq!(err.into_details(), json!({ "code": "invalid_template", "message": "bad" }));
    }

    #[test]
    fn test_generic_plain_message_wrapped() {
        let err = ActionError::Failed("socket hang up".to_string());
        assert_eq!(err.into_details(), json!({ "error": "socket hang up" }));
    }

    #[test]
    fn test_generic_null_message_wrapped() {
        let err = ActionError::Failed("null".to_string());
        assert_eq!(err.into_details(), json!({ "error": "null" }));
    }

    #[test]
    fn test_cancel_flow_details() {
        let err = ActionError::CancelFlow { reason: "condition not met".to_string() };
        assert!(err.is_cancel_flow());
        assert_eq!(err.into_details()["cancelled"], json!(true));
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
