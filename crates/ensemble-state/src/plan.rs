//! Plan and task records produced by the planning phase.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Estimated complexity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

/// A single task within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    /// Unique id within the plan, used in `depends_on` references and
    /// branch names.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Files the planner expects this task to touch.
    #[serde(default)]
    pub files: Vec<String>,
    /// Ids of tasks that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lower runs earlier within a group.
    #[serde(default)]
    pub priority: i32,
    pub est_complexity: Complexity,
    /// Optional external issue URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
}

/// A validated plan: tasks, dependencies, and the execution-order layering.
///
/// `execution_order` is computed exactly once, at plan-acceptance time, and
/// covers every task id exactly once. Each inner vector is one group of
/// tasks eligible for parallel execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub summary: String,
    pub tasks: Vec<PlanTask>,
    /// Groups of task ids in execution order. Empty until the plan has been
    /// accepted (see `ensemble-core`'s layering).
    #[serde(default)]
    pub execution_order: Vec<Vec<String>>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Plan {
    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Build the task -> predecessors mapping from the per-task
    /// `depends_on` lists.
    pub fn dependencies(&self) -> BTreeMap<String, Vec<String>> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), t.depends_on.clone()))
            .collect()
    }

    /// Total number of tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
