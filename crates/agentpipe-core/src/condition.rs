//! Condition evaluation: a pluggable expression language over `RunState`.
//!
//! The engine itself never parses templates beyond delegating to this trait
//! (see the re-architecture note on template-string conditions) — `GroupOrchestrator`
//! only calls `ConditionEvaluator::evaluate` and treats any `Err` as `false`
//! (fail-safe) plus a warning.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::RunState;

/// Outcome of evaluating a stage's `condition` against the current run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationResult {
    True,
    False,
}

impl From<bool> for EvaluationResult {
    fn from(b: bool) -> Self {
        if b {
            EvaluationResult::True
        } else {
            EvaluationResult::False
        }
    }
}

impl EvaluationResult {
    pub fn as_bool(self) -> bool {
        matches!(self, EvaluationResult::True)
    }
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, state: &RunState) -> Result<EvaluationResult, String>;
}

/// Evaluates `{{ stages.<name>.outputs.<field> <op> <literal> }}`-style expressions.
///
/// Supported forms inside the braces:
///   `stages.<name>.status == "success"`
///   `stages.<name>.outputs.<field> > 0`
///   `stages.<name>.outputs.<field>`              (truthy check)
///
/// `outputs` resolves to the stage's structured JSON output (parsed from
/// `agent_output` when it looks like JSON), falling back to `null` if absent or
/// unparsable.
#[derive(Debug, Default)]
pub struct TemplateConditionEvaluator;

const OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];

impl ConditionEvaluator for TemplateConditionEvaluator {
    fn evaluate(&self, condition: &str, state: &RunState) -> Result<EvaluationResult, String> {
        let expr = extract_braced_expression(condition)?;
        let view = build_state_view(state);

        for op in OPERATORS {
            if let Some(idx) = find_operator(&expr, op) {
                let (lhs, rhs) = expr.split_at(idx);
                let rhs = &rhs[op.len()..];
                let left = resolve(lhs.trim(), &view)?;
                let right = parse_literal(rhs.trim(), &view)?;
                return Ok(compare(&left, op, &right)?.into());
            }
        }

        // No operator: truthy check on the resolved value.
        let value = resolve(expr.trim(), &view)?;
        Ok(truthy(&value).into())
    }
}

fn extract_braced_expression(condition: &str) -> Result<String, String> {
    let trimmed = condition.trim();
    let inner = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .ok_or_else(|| format!("condition '{condition}' is not a {{{{ ... }}}} expression"))?;
    Ok(inner.trim().to_string())
}

fn find_operator(expr: &str, op: &str) -> Option<usize> {
    // Guard against matching the '=' inside '==' twice, and avoid splitting
    // inside quoted literals.
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i + op_bytes.len() <= bytes.len() {
        if bytes[i] == b'"' {
            in_quotes = !in_quotes;
        }
        if !in_quotes && &bytes[i..i + op_bytes.len()] == op_bytes {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn build_state_view(state: &RunState) -> Value {
    let mut stages = serde_json::Map::new();
    for exec in &state.stages {
        let outputs = exec
            .agent_output
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .unwrap_or(Value::Null);
        let mut entry = serde_json::Map::new();
        entry.insert("status".into(), Value::String(exec.status.as_str().into()));
        entry.insert("outputs".into(), outputs);
        entry.insert(
            "conditionResult".into(),
            exec.condition_result.map(Value::Bool).unwrap_or(Value::Null),
        );
        stages.insert(exec.stage_name.clone(), Value::Object(entry));
    }

    let mut root = serde_json::Map::new();
    root.insert("stages".into(), Value::Object(stages));
    root.insert("runId".into(), Value::String(state.run_id.to_string()));
    root.insert(
        "trigger".into(),
        serde_json::to_value(&state.trigger).unwrap_or(Value::Null),
    );
    Value::Object(root)
}

fn resolve(path: &str, view: &Value) -> Result<Value, String> {
    let mut current = view;
    for segment in path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| format!("path segment '{segment}' not found while resolving '{path}'"))?;
    }
    Ok(current.clone())
}

fn parse_literal(token: &str, view: &Value) -> Result<Value, String> {
    if let Some(stripped) = token.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Value::String(stripped.to_string()));
    }
    if token == "true" {
        return Ok(Value::Bool(true));
    }
    if token == "false" {
        return Ok(Value::Bool(false));
    }
    if let Ok(n) = token.parse::<f64>() {
        return Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    // Fall back to treating it as another path reference.
    resolve(token, view)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(left: &Value, op: &str, right: &Value) -> Result<bool, String> {
    match op {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        ">" | "<" | ">=" | "<=" => {
            let l = left
                .as_f64()
                .ok_or_else(|| format!("left operand {left:?} is not numeric"))?;
            let r = right
                .as_f64()
                .ok_or_else(|| format!("right operand {right:?} is not numeric"))?;
            Ok(match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                "<=" => l <= r,
                _ => unreachable!(),
            })
        }
        _ => Err(format!("unsupported operator '{op}'")),
    }
}

/// In-memory fake for tests: maps condition strings directly to outcomes.
#[derive(Debug, Default)]
pub struct FakeConditionEvaluator {
    pub fixed: HashMap<String, Result<bool, String>>,
}

impl ConditionEvaluator for FakeConditionEvaluator {
    fn evaluate(&self, condition: &str, _state: &RunState) -> Result<EvaluationResult, String> {
        match self.fixed.get(condition) {
            Some(Ok(b)) => Ok((*b).into()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(format!("no fixed result for condition '{condition}'")),
        }
    }
}
