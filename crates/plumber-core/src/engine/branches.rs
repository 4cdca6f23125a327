//! Branch reconstruction from the flat, depth-tagged step list.
//!
//! If-then branches are persisted as a flat position-ordered list. Each
//! if-then control step carries `parameters.depth`; everything between one
//! control step and the next control step at the same (or a shallower) depth
//! belongs to that branch. Nothing here is cached: callers re-derive the
//! grouping whenever they need it.

use plumber_types::flow::{Step, StepStatus};

/// Split `steps` into contiguous branch groups at `current_depth`.
///
/// The first step always seeds the first group. For every following step:
/// - non-control steps, control steps without a parseable depth, and deeper
///   control steps join the current group;
/// - a control step at `current_depth` starts a new sibling group;
/// - a shallower control step closes the current group and ends the scan,
///   since it belongs to an ancestor's sibling.
///
/// Without an early stop, concatenating the groups reproduces `steps`.
pub fn extract_branches(steps: &[Step], current_depth: i64) -> Vec<&[Step]> {
    let mut groups = Vec::new();
    if steps.is_empty() {
        return groups;
    }

    let mut start = 0;
    for (index, step) in steps.iter().enumerate().skip(1) {
        if !step.is_if_then() {
            continue;
        }
        let Some(depth) = step.depth() else {
            // Fresh nested branch whose depth has not been saved yet.
            continue;
        };

        if depth == current_depth {
            groups.push(&steps[start..index]);
            start = index;
        } else if depth < current_depth {
            groups.push(&steps[start..index]);
            return groups;
        }
    }

    groups.push(&steps[start..]);
    groups
}

/// A branch is complete when it holds at least one step beyond its control
/// step and every step in it is completed.
pub fn is_branch_completed(group: &[Step]) -> bool {
    group.len() > 1 && group.iter().all(|step| step.status == StepStatus::Completed)
}

/// Whether every branch at `depth`, and every branch nested inside them, is
/// complete.
pub fn are_all_branches_completed(steps: &[Step], depth: i64) -> bool {
    extract_branches(steps, depth).into_iter().all(|group| {
        if !is_branch_completed(group) {
            return false;
        }
        match nested_start(group, depth) {
            Some(offset) => are_all_branches_completed(&group[offset..], depth + 1),
            None => true,
        }
    })
}

/// Index of the first nested control step inside `group`, skipping its root.
fn nested_start(group: &[Step], depth: i64) -> Option<usize> {
    group
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, step)| step.is_if_then() && step.depth().is_none_or(|d| d > depth))
        .map(|(index, _)| index)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
