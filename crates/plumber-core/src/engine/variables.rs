//! Step variable flattening and parameter substitution.
//!
//! Two separate contracts live here:
//! - [`compute_parameters`] substitutes `{{step.<ref>.<path>}}` tokens in a
//!   step's parameters with values from prior execution steps. It ignores
//!   display metadata entirely, so hidden outputs stay substitutable.
//! - [`extract_variables`] lists the variables an author can pick from,
//!   applying labels, ordering, and the hidden flag from `data_out_metadata`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use plumber_types::execution::{DataOutMetadatum, ExecutionStep};
use plumber_types::flow::Step;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Matches `{{step.<ref>.<path>}}`. Group 1 is the step reference, group 2 the
/// dotted path including its leading dot.
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{step\.([\da-zA-Z-]+)((?:\.[^.{}]+)+)\}\}").expect("variable pattern is valid")
});

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// Flatten nested JSON into `(dotted path, leaf)` pairs.
///
/// Object keys and array indices are joined by `.`. Numbers, strings,
/// booleans, and null are leaves; empty objects and arrays produce nothing.
/// Pairs come out in document order.
pub fn flatten(data: &Value) -> Vec<(String, Value)> {
    let mut leaves = Vec::new();
    flatten_into(data, "", &mut leaves);
    leaves
}

fn flatten_into(value: &Value, prefix: &str, leaves: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(nested, &join_path(prefix, key), leaves);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(nested, &join_path(prefix, &index.to_string()), leaves);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                leaves.push((prefix.to_string(), leaf.clone()));
            }
        }
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Walk a dotted path through objects (by key) and arrays (by index).
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// Resolve every variable token in `parameters` against prior step outputs.
///
/// - A string that is exactly one token becomes the referenced value with its
///   native type (`null` when it cannot be resolved).
/// - Tokens embedded in a longer string are replaced by their string form and
///   the result stays a string, unless it now parses as a JSON object or array.
/// - References to steps that have not run, or to paths that do not exist,
///   resolve to nothing; they never produce an error.
///
/// Parameters without tokens are returned unchanged.
pub fn compute_parameters(parameters: &Value, prior_execution_steps: &[ExecutionStep]) -> Value {
    let mut resolver = Resolver {
        prior: prior_execution_steps,
        index: None,
    };
    resolver.resolve_value(parameters)
}

struct Resolver<'a> {
    prior: &'a [ExecutionStep],
    /// Built on the first token encountered.
    index: Option<OutputIndex<'a>>,
}

impl<'a> Resolver<'a> {
    fn resolve_value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(text) => self.resolve_string(text),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.resolve_value(item)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, nested)| (key.clone(), self.resolve_value(nested)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&mut self, text: &str) -> Value {
        if !VARIABLE_PATTERN.is_match(text) {
            return Value::String(text.to_string());
        }

        if let Some(caps) = VARIABLE_PATTERN.captures(text) {
            if let Some(whole) = caps.get(0) {
                if whole.start() == 0 && whole.end() == text.len() {
                    return self.lookup(&caps).unwrap_or(Value::Null);
                }
            }
        }

        let mut rendered = String::with_capacity(text.len());
        let mut last_end = 0;
        for caps in VARIABLE_PATTERN.captures_iter(text) {
            let Some(token) = caps.get(0) else {
                continue;
            };
            rendered.push_str(&text[last_end..token.start()]);
            if let Some(value) = self.lookup(&caps) {
                rendered.push_str(&stringify(&value));
            }
            last_end = token.end();
        }
        rendered.push_str(&text[last_end..]);

        let trimmed = rendered.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(&rendered) {
                return parsed;
            }
        }

        Value::String(rendered)
    }

    fn lookup(&mut self, caps: &regex::Captures<'_>) -> Option<Value> {
        let reference = caps.get(1)?.as_str();
        let path = caps.get(2)?.as_str().trim_start_matches('.');
        let prior = self.prior;
        self.index
            .get_or_insert_with(|| OutputIndex::build(prior))
            .lookup(reference, path)
    }
}

/// Prior outputs keyed by step ID, with lazily flattened leaf maps.
struct OutputIndex<'a> {
    /// Latest recorded output per step.
    outputs: HashMap<String, &'a Value>,
    /// Distinct step IDs in the order they first executed.
    executed: Vec<String>,
    flattened: HashMap<String, HashMap<String, Value>>,
}

impl<'a> OutputIndex<'a> {
    fn build(prior: &'a [ExecutionStep]) -> Self {
        let mut outputs = HashMap::new();
        let mut executed = Vec::new();
        let mut seen = HashSet::new();

        for execution_step in prior {
            let step_key = execution_step.step_id.to_string();
            if seen.insert(step_key.clone()) {
                executed.push(step_key.clone());
            }
            if let Some(data_out) = &execution_step.data_out {
                outputs.insert(step_key, data_out);
            }
        }

        Self {
            outputs,
            executed,
            flattened: HashMap::new(),
        }
    }

    fn lookup(&mut self, reference: &str, path: &str) -> Option<Value> {
        let step_key = self.resolve_reference(reference)?;
        let output = *self.outputs.get(&step_key)?;

        let leaves = self
            .flattened
            .entry(step_key)
            .or_insert_with(|| flatten(output).into_iter().collect());
        if let Some(leaf) = leaves.get(path) {
            return Some(leaf.clone());
        }

        get_path(output, path).cloned()
    }

    /// A reference is a step ID, or failing that a 0-based index into the
    /// executed steps.
    fn resolve_reference(&self, reference: &str) -> Option<String> {
        if self.executed.iter().any(|key| key == reference) {
            return Some(reference.to_string());
        }
        let index = reference.parse::<usize>().ok()?;
        self.executed.get(index).cloned()
    }
}

/// String form of a value spliced into a larger string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Display listing
// ---------------------------------------------------------------------------

/// A variable offered to authors when editing a later step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    /// Full token path, e.g. `step.<stepId>.items.0.id`.
    pub name: String,
    pub label: Option<String>,
    pub order: Option<i64>,
    pub value: Value,
}

/// The visible variables produced by one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepVariables {
    pub id: Uuid,
    /// Display name, e.g. `1. Github`.
    pub name: String,
    pub output: Vec<Variable>,
}

/// List the variables each executed step exposes, for display.
///
/// Steps without any execution record are skipped, as are steps whose
/// outputs are entirely hidden. The latest record of each step is used.
pub fn extract_variables(steps: &[Step], execution_steps: &[ExecutionStep]) -> Vec<StepVariables> {
    steps
        .iter()
        .filter_map(|step| {
            execution_steps
                .iter()
                .rev()
                .find(|execution_step| execution_step.step_id == step.id)
                .map(|execution_step| (step, execution_step))
        })
        .enumerate()
        .map(|(index, (step, execution_step))| {
            let empty = Value::Object(serde_json::Map::new());
            let data_out = execution_step.data_out.as_ref().unwrap_or(&empty);
            let metadata = execution_step.data_out_metadata.as_ref().unwrap_or(&empty);

            StepVariables {
                id: step.id,
                name: format!("{}. {}", index + 1, capitalize(step.app_key.as_deref().unwrap_or(""))),
                output: visible_variables(step.id, data_out, metadata),
            }
        })
        .filter(|step_variables| !step_variables.output.is_empty())
        .collect()
}

fn visible_variables(step_id: Uuid, data_out: &Value, metadata: &Value) -> Vec<Variable> {
    let mut variables: Vec<Variable> = flatten(data_out)
        .into_iter()
        .filter_map(|(path, value)| {
            let metadatum = get_path(metadata, &path)
                .and_then(|m| serde_json::from_value::<DataOutMetadatum>(m.clone()).ok())
                .unwrap_or_default();
            if metadatum.is_hidden {
                return None;
            }
            Some(Variable {
                name: format!("step.{step_id}.{path}"),
                label: metadatum.label,
                order: metadatum.order,
                value,
            })
        })
        .collect();

    // Stable sort: ordered variables first, unordered keep document order.
    // An order of 0 counts as unset.
    let sort_key = |variable: &Variable| variable.order.filter(|order| *order != 0);
    variables.sort_by(|a, b| match (sort_key(a), sort_key(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(&y),
    });
    variables
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
