//! Plan validation and execution-order layering.
//!
//! A plan's `execution_order` is computed exactly once, at plan-acceptance
//! time, as a deterministic topological layering of the task dependency
//! graph: repeatedly emit the set of zero-in-degree tasks as the next
//! group, sorted by priority (ascending, stable on ties by id). A layer
//! that comes up empty while tasks remain means the graph has a cycle and
//! the plan is rejected.
//!
//! The ready-set rule lives here too so the scheduler and the invariants
//! tests share one definition.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use ensemble_state::plan::{Plan, PlanTask};
use ensemble_state::sentinels::PlanPayload;
use ensemble_state::session::UltraPlanState;
use uuid::Uuid;

/// Structural problems that make a plan unacceptable. No state transition
/// occurs on rejection.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Validate a plan's structure: at least one task, unique ids, and every
/// `depends_on` reference pointing at an existing task.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.tasks.is_empty() {
        return Err(PlanError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(PlanError::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Compute the execution-order layering with Kahn's algorithm.
///
/// Each emitted layer is sorted ascending by priority, stable on ties by
/// task id, so start order within a group is deterministic. Detects
/// cycles: if no zero-in-degree task remains while tasks are unplaced,
/// the plan is rejected.
pub fn compute_execution_order(plan: &Plan) -> Result<Vec<Vec<String>>, PlanError> {
    validate_plan(plan)?;

    let index_of: HashMap<&str, usize> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let n = plan.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![vec![]; n];

    for (task_idx, task) in plan.tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let dep_idx = index_of[dep.as_str()];
            successors[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut placed = 0usize;
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    while !current.is_empty() {
        // Deterministic group order: priority ascending, then id.
        current.sort_by(|&a, &b| {
            let (ta, tb) = (&plan.tasks[a], &plan.tasks[b]);
            ta.priority.cmp(&tb.priority).then_with(|| ta.id.cmp(&tb.id))
        });

        let mut next: Vec<usize> = Vec::new();
        for &idx in &current {
            for &succ in &successors[idx] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }

        placed += current.len();
        order.push(current.iter().map(|&i| plan.tasks[i].id.clone()).collect());
        current = next;
    }

    if placed != n {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| plan.tasks[i].id.as_str())
            .collect();
        return Err(PlanError::CycleDetected(cycle.join(", ")));
    }

    Ok(order)
}

/// Build a validated [`Plan`] from a planner agent's sentinel payload,
/// computing the execution order in the process.
pub fn accept_plan(payload: PlanPayload) -> Result<Plan, PlanError> {
    let tasks: Vec<PlanTask> = payload
        .tasks
        .into_iter()
        .map(|t| PlanTask {
            id: t.id,
            title: t.title,
            description: t.description,
            files: t.files,
            depends_on: t.depends_on,
            priority: t.priority,
            est_complexity: t.est_complexity,
            issue_url: t.issue_url,
        })
        .collect();

    let mut plan = Plan {
        id: Uuid::new_v4(),
        summary: payload.summary,
        tasks,
        execution_order: Vec::new(),
        insights: payload.insights,
        constraints: payload.constraints,
    };

    plan.execution_order = compute_execution_order(&plan)?;
    Ok(plan)
}

/// Compute the ready set for the current group.
///
/// The ready set is the subset of the current group whose predecessors
/// are all completed, excluding tasks already completed, failed, or
/// mapped to a live instance. While a group decision is awaiting
/// resolution the ready set is empty. Tasks from future groups are never
/// returned.
pub fn ready_set(state: &UltraPlanState) -> Vec<String> {
    if let Some(decision) = &state.group_decision {
        if decision.awaiting_decision {
            return Vec::new();
        }
    }

    let Some(plan) = &state.plan else {
        return Vec::new();
    };
    let Some(group) = plan.execution_order.get(state.current_group) else {
        return Vec::new();
    };

    let deps: BTreeMap<String, Vec<String>> = plan.dependencies();

    group
        .iter()
        .filter(|id| {
            !state.completed.contains(*id)
                && !state.failed.contains(*id)
                && !state.running.contains_key(*id)
        })
        .filter(|id| {
            deps.get(*id)
                .map(|preds| preds.iter().all(|p| state.completed.contains(p)))
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}
