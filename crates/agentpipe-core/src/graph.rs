//! DAG planner: levels stage declarations into execution groups.
//!
//! Pure, no I/O — `build_execution_plan` is deterministic for a given
//! `PipelineConfig` (L2: identical output for identical input).

use std::collections::{HashMap, HashSet};

use crate::model::{ExecutionGraph, ExecutionGroup, ExecutionPlan, PipelineConfig, PlanValidation};

const CHAIN_DEPTH_WARNING: usize = 5;
const GROUP_SIZE_WARNING: usize = 8;

/// Structured planner error, surfaced only through `validation.errors` — never
/// returned directly, since an invalid plan is still a valid (empty) `ExecutionGraph`
/// value the runner can inspect before deciding whether to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    CycleDetected(Vec<String>),
    UnknownDependency { from: String, to: String },
    DuplicateStageName(String),
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerError::CycleDetected(stages) => {
                write!(f, "cycle detected among stages: {}", stages.join(" -> "))
            }
            PlannerError::UnknownDependency { from, to } => {
                write!(f, "stage '{from}' depends on unknown stage '{to}'")
            }
            PlannerError::DuplicateStageName(name) => {
                write!(f, "duplicate stage name: '{name}'")
            }
        }
    }
}

/// Build the execution plan for a pipeline configuration. Always returns a graph;
/// fatal structural problems are recorded in `validation` with `is_valid = false`
/// rather than as a `Result::Err`, so the caller (the runner) decides whether to
/// abort before any stage executes.
pub fn build_execution_plan(config: &PipelineConfig) -> ExecutionGraph {
    let mut errors: Vec<PlannerError> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let mut seen_names: HashSet<&str> = HashSet::new();
    for stage in &config.stages {
        if !seen_names.insert(stage.name.as_str()) {
            errors.push(PlannerError::DuplicateStageName(stage.name.clone()));
        }
    }

    let stage_names: HashSet<&str> = config.stages.iter().map(|s| s.name.as_str()).collect();
    for stage in &config.stages {
        for dep in &stage.depends_on {
            if !stage_names.contains(dep.as_str()) {
                errors.push(PlannerError::UnknownDependency {
                    from: stage.name.clone(),
                    to: dep.clone(),
                });
            }
        }
    }

    // Adjacency for cycle detection: node -> its dependencies.
    let adjacency: HashMap<&str, Vec<&str>> = config
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    if let Some(cycle) = detect_cycle(&adjacency) {
        errors.push(PlannerError::CycleDetected(
            cycle.into_iter().map(String::from).collect(),
        ));
    }

    let is_valid = errors.is_empty();
    let mut groups = Vec::new();
    let mut max_parallelism = 0;

    if is_valid {
        groups = level_stages(config);
        max_parallelism = groups.iter().map(|g| g.stages.len()).max().unwrap_or(0);

        for group in &groups {
            if group.stages.len() > GROUP_SIZE_WARNING {
                warnings.push(format!(
                    "group at level {} has {} stages, exceeding the recommended maximum of {}",
                    group.level,
                    group.stages.len(),
                    GROUP_SIZE_WARNING
                ));
            }
        }

        let max_level = groups.iter().map(|g| g.level).max().unwrap_or(0);
        if max_level + 1 > CHAIN_DEPTH_WARNING {
            warnings.push(format!(
                "pipeline has a dependency chain {} levels deep, exceeding the recommended maximum of {}",
                max_level + 1,
                CHAIN_DEPTH_WARNING
            ));
        }

        if config.stages.len() > 1 {
            for stage in &config.stages {
                let has_dependents = config
                    .stages
                    .iter()
                    .any(|s| s.depends_on.contains(&stage.name));
                if stage.depends_on.is_empty() && !has_dependents {
                    warnings.push(format!(
                        "stage '{}' has no dependencies and no dependents",
                        stage.name
                    ));
                }
            }
        }
    }

    ExecutionGraph {
        plan: ExecutionPlan {
            groups,
            max_parallelism,
        },
        validation: PlanValidation {
            errors: errors.into_iter().map(|e| e.to_string()).collect(),
            warnings,
            is_valid,
        },
    }
}

/// Kahn-style BFS leveling: nodes with zero in-degree form level 0; removing them
/// exposes the next level, and so on. Declaration order is preserved within a level.
fn level_stages(config: &PipelineConfig) -> Vec<ExecutionGroup> {
    let mut remaining_deps: HashMap<&str, HashSet<&str>> = config
        .stages
        .iter()
        .map(|s| {
            (
                s.name.as_str(),
                s.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut placed: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();
    let mut level = 0usize;

    while placed.len() < config.stages.len() {
        let ready: Vec<&crate::model::StageConfig> = config
            .stages
            .iter()
            .filter(|s| {
                !placed.contains(s.name.as_str())
                    && remaining_deps
                        .get(s.name.as_str())
                        .map(|deps| deps.iter().all(|d| placed.contains(d)))
                        .unwrap_or(true)
            })
            .collect();

        if ready.is_empty() {
            // Should be unreachable once cycle detection has already run, but
            // guard against it rather than looping forever.
            break;
        }

        for s in &ready {
            placed.insert(s.name.as_str());
        }

        groups.push(ExecutionGroup {
            level,
            stages: ready.into_iter().cloned().collect(),
        });
        level += 1;
        remaining_deps.retain(|k, _| !placed.contains(k));
    }

    groups
}

fn detect_cycle<'a>(adjacency: &HashMap<&'a str, Vec<&'a str>>) -> Option<Vec<&'a str>> {
    #[derive(PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<&'a str>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        path.push(node);

        if let Some(deps) = adjacency.get(node) {
            for dep in deps {
                if let Some(cycle) = visit(dep, adjacency, marks, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for node in adjacency.keys() {
        if !marks.contains_key(node) {
            if let Some(cycle) = visit(node, adjacency, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}
