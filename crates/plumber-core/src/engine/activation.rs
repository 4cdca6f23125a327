//! Structural check run before a flow is switched on.

use plumber_types::error::FlowError;
use plumber_types::flow::{Step, StepType};

/// Verify that a flow's steps form a runnable pipeline: exactly one trigger
/// at position 1, followed by at least one action.
///
/// Steps may be passed in any order; they are checked sorted by position.
pub fn check_activation_eligibility(steps: &[Step]) -> Result<(), FlowError> {
    let mut ordered: Vec<&Step> = steps.iter().collect();
    ordered.sort_by_key(|step| step.position);

    let Some((first, rest)) = ordered.split_first() else {
        return Err(FlowError::Empty);
    };
    if first.step_type != StepType::Trigger || first.position != 1 {
        return Err(FlowError::MissingTrigger);
    }
    if let Some(stray) = rest.iter().find(|step| step.step_type == StepType::Trigger) {
        return Err(FlowError::MisplacedTrigger(stray.position));
    }
    if rest.is_empty() {
        return Err(FlowError::NoActions);
    }
    Ok(())
}
