//! Workflow phases and the phase transition graph.
//!
//! Each workflow mode has its own path through the shared [`Phase`] enum.
//! [`is_valid_transition`] enforces the allowed edges per mode, mirroring
//! the phase state machines:
//!
//! ```text
//! ultra-plan:  planning -> plan_selection? -> refresh -> executing
//!              -> synthesis -> (revision -> synthesis)* -> consolidating
//!              -> complete
//! adversarial: implementing <-> reviewing -> approved -> complete
//! iterative:   working -> (paused <-> working | complete | max_iterations)
//! triple-shot: working -> evaluating -> complete
//! ```
//!
//! `failed` and `cancelled` are reachable from any non-terminal phase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The workflow mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    UltraPlan,
    Adversarial,
    Iterative,
    TripleShot,
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UltraPlan => "ultra_plan",
            Self::Adversarial => "adversarial",
            Self::Iterative => "iterative",
            Self::TripleShot => "triple_shot",
        };
        f.write_str(s)
    }
}

/// A phase in a workflow session's lifecycle.
///
/// The enum is shared across all modes; which variants are reachable
/// depends on the session's [`WorkflowMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    // ultra-plan
    Planning,
    PlanSelection,
    Refresh,
    Executing,
    Synthesis,
    Revision,
    Consolidating,
    // adversarial
    Implementing,
    Reviewing,
    Approved,
    // iterative and triple-shot
    Working,
    Evaluating,
    Paused,
    MaxIterations,
    // terminal
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    /// Whether this phase is terminal: once entered, no further transitions
    /// occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Cancelled | Self::MaxIterations
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::PlanSelection => "plan_selection",
            Self::Refresh => "refresh",
            Self::Executing => "executing",
            Self::Synthesis => "synthesis",
            Self::Revision => "revision",
            Self::Consolidating => "consolidating",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Working => "working",
            Self::Evaluating => "evaluating",
            Self::Paused => "paused",
            Self::MaxIterations => "max_iterations",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "plan_selection" => Ok(Self::PlanSelection),
            "refresh" => Ok(Self::Refresh),
            "executing" => Ok(Self::Executing),
            "synthesis" => Ok(Self::Synthesis),
            "revision" => Ok(Self::Revision),
            "consolidating" => Ok(Self::Consolidating),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "approved" => Ok(Self::Approved),
            "working" => Ok(Self::Working),
            "evaluating" => Ok(Self::Evaluating),
            "paused" => Ok(Self::Paused),
            "max_iterations" => Ok(Self::MaxIterations),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

/// Check whether a transition from `from` to `to` is a valid edge in the
/// phase graph for `mode`.
///
/// Any non-terminal phase may transition to `Failed` or `Cancelled`.
/// Terminal phases have no outgoing edges.
pub fn is_valid_transition(mode: WorkflowMode, from: Phase, to: Phase) -> bool {
    if from.is_terminal() {
        return false;
    }
    if matches!(to, Phase::Failed | Phase::Cancelled) {
        return true;
    }

    match mode {
        WorkflowMode::UltraPlan => matches!(
            (from, to),
            (Phase::Planning, Phase::PlanSelection)
                | (Phase::Planning, Phase::Refresh)
                | (Phase::PlanSelection, Phase::Refresh)
                | (Phase::Refresh, Phase::Executing)
                | (Phase::Executing, Phase::Synthesis)
                | (Phase::Synthesis, Phase::Revision)
                | (Phase::Revision, Phase::Synthesis)
                | (Phase::Synthesis, Phase::Consolidating)
                | (Phase::Consolidating, Phase::Complete)
        ),
        WorkflowMode::Adversarial => matches!(
            (from, to),
            (Phase::Implementing, Phase::Reviewing)
                | (Phase::Reviewing, Phase::Implementing)
                | (Phase::Reviewing, Phase::Approved)
                | (Phase::Approved, Phase::Complete)
        ),
        WorkflowMode::Iterative => matches!(
            (from, to),
            (Phase::Working, Phase::Paused)
                | (Phase::Paused, Phase::Working)
                | (Phase::Working, Phase::Complete)
                | (Phase::Working, Phase::MaxIterations)
        ),
        WorkflowMode::TripleShot => matches!(
            (from, to),
            (Phase::Working, Phase::Evaluating) | (Phase::Evaluating, Phase::Complete)
        ),
    }
}
