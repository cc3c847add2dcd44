//! Sentinel payload schemas.
//!
//! Each phase of a workflow has one canonical sentinel file that the agent
//! writes into its worktree on completion. A sentinel is a single JSON
//! object; its presence is the only completion signal the coordinator
//! trusts. The types here are the deserialization targets -- unrecognized
//! keys are ignored, missing required keys are a parse failure.
//!
//! The coordinator only ever reads and deletes these files; it never
//! writes them.

use serde::{Deserialize, Serialize};

use crate::plan::Complexity;

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// `plan.json` -- the plan draft written by a planner agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPayload {
    pub summary: String,
    pub tasks: Vec<PlanTaskPayload>,
    pub insights: Vec<String>,
    pub constraints: Vec<String>,
}

/// One task entry inside [`PlanPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTaskPayload {
    pub id: String,
    pub title: String,
    pub description: String,
    pub files: Vec<String>,
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub est_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Task execution
// ---------------------------------------------------------------------------

/// Status field of a `task-complete.json` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSentinelStatus {
    Complete,
    Failed,
    Blocked,
}

/// `task-complete.json` -- written by a task agent when it is done.
///
/// Any status other than `complete` counts as a failure for scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletePayload {
    pub task_id: String,
    pub status: TaskSentinelStatus,
    pub summary: String,
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ---------------------------------------------------------------------------
// Synthesis / revision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    Complete,
    NeedsRevision,
}

/// Severity of an issue found during synthesis. Only `critical` and
/// `major` issues drive a revision round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
}

impl IssueSeverity {
    /// Whether this severity forces a revision round.
    pub fn drives_revision(&self) -> bool {
        matches!(self, Self::Critical | Self::Major)
    }
}

/// One issue entry inside [`SynthesisPayload::issues_found`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// `synthesis-complete.json` -- written by the synthesis agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisPayload {
    pub status: SynthesisStatus,
    pub revision_round: u32,
    pub issues_found: Vec<IssuePayload>,
    pub tasks_affected: Vec<String>,
    pub integration_notes: String,
    pub recommendations: Vec<String>,
}

impl SynthesisPayload {
    /// Whether any critical or major issue was reported.
    pub fn needs_revision(&self) -> bool {
        self.status == SynthesisStatus::NeedsRevision
            && self.issues_found.iter().any(|i| i.severity.drives_revision())
    }
}

/// `revision-complete.json` -- written by a revision agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionPayload {
    pub task_id: String,
    pub revision_round: u32,
    pub issues_addressed: Vec<String>,
    pub summary: String,
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub remaining_issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupConsolidationStatus {
    Complete,
    Failed,
}

/// `group-consolidation-complete.json` -- written by a delegated
/// consolidator agent for one execution group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConsolidationPayload {
    pub group_index: usize,
    pub status: GroupConsolidationStatus,
    pub branch_name: String,
    pub tasks_consolidated: Vec<String>,
    pub conflicts_resolved: Vec<String>,
    /// Free-form verification record (build/test evidence); the
    /// coordinator stores it but does not interpret its shape.
    pub verification: serde_json::Value,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub issues_for_next_group: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Complete,
    Partial,
    Failed,
}

/// `consolidation-complete.json` -- written by the overall consolidator
/// agent at the end of an ultra-plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationPayload {
    pub status: ConsolidationStatus,
    pub mode: String,
    /// Per-group results; shape is agent-defined and stored verbatim.
    pub group_results: serde_json::Value,
    pub prs_created: Vec<String>,
    pub total_commits: u64,
    pub files_changed: u64,
}

// ---------------------------------------------------------------------------
// Adversarial
// ---------------------------------------------------------------------------

/// `adversarial-increment.json` -- written by the implementer each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementPayload {
    pub round: u32,
    pub status: String,
    pub summary: String,
}

impl IncrementPayload {
    /// Whether the implementer reported failure.
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

/// `adversarial-review.json` -- written by the reviewer each round.
///
/// `score` is compared against the session's minimum passing score; see
/// [`crate::session::effective_minimum_score`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub round: u32,
    pub approved: bool,
    pub score: i64,
    pub summary: String,
    pub required_changes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Iterative loop
// ---------------------------------------------------------------------------

/// `ralph-status.json` -- periodic status written by the long-lived
/// iterative-loop agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RalphStatusPayload {
    pub iteration: u32,
    pub phase: String,
    pub promise_found: bool,
    pub last_activity: String,
    pub commit_count: u64,
    pub files_modified: Vec<String>,
}

// ---------------------------------------------------------------------------
// Triple-shot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSentinelStatus {
    Complete,
    Failed,
}

/// `tripleshot-complete.json` -- written by each of the three attempt
/// agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptPayload {
    pub attempt_index: u32,
    pub status: AttemptSentinelStatus,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub approach: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Strategy the judge chose for combining the three attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Select,
    Merge,
    Combine,
}

/// Per-attempt scoring inside [`EvaluationPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvaluation {
    pub attempt_index: u32,
    pub score: i64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// `tripleshot-evaluation.json` -- written by the judge agent.
///
/// `winner_index` is -1 when no attempt is usable, otherwise 0..=2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPayload {
    pub winner_index: i32,
    pub merge_strategy: MergeStrategy,
    pub reasoning: String,
    pub attempt_evaluations: Vec<AttemptEvaluation>,
    #[serde(default)]
    pub suggested_changes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_complete_parses_with_optional_keys_absent() {
        let json = r#"{
            "task_id": "t1",
            "status": "complete",
            "summary": "done",
            "files_modified": ["src/lib.rs"]
        }"#;
        let payload: TaskCompletePayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.status, TaskSentinelStatus::Complete);
        assert!(payload.notes.is_none());
        assert!(payload.issues.is_empty());
    }

    #[test]
    fn task_complete_rejects_missing_required_key() {
        // No summary.
        let json = r#"{"task_id": "t1", "status": "complete", "files_modified": []}"#;
        assert!(serde_json::from_str::<TaskCompletePayload>(json).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = r#"{
            "round": 1,
            "approved": true,
            "score": 9,
            "summary": "solid",
            "required_changes": [],
            "extra_field_from_newer_agent": {"ignored": true}
        }"#;
        let payload: ReviewPayload = serde_json::from_str(json).unwrap();
        assert!(payload.approved);
        assert_eq!(payload.score, 9);
    }

    #[test]
    fn plan_payload_requires_insights_and_constraints() {
        let json = r#"{"summary": "s", "tasks": []}"#;
        assert!(serde_json::from_str::<PlanPayload>(json).is_err());
    }

    #[test]
    fn synthesis_needs_revision_only_for_critical_or_major() {
        let minor_only = SynthesisPayload {
            status: SynthesisStatus::NeedsRevision,
            revision_round: 1,
            issues_found: vec![IssuePayload {
                severity: IssueSeverity::Minor,
                description: "nit".to_string(),
                task_id: None,
                files: vec![],
            }],
            tasks_affected: vec![],
            integration_notes: String::new(),
            recommendations: vec![],
        };
        assert!(!minor_only.needs_revision());

        let mut with_major = minor_only.clone();
        with_major.issues_found.push(IssuePayload {
            severity: IssueSeverity::Major,
            description: "broken import".to_string(),
            task_id: Some("t2".to_string()),
            files: vec!["src/api.rs".to_string()],
        });
        assert!(with_major.needs_revision());
    }

    #[test]
    fn evaluation_winner_index_accepts_negative_one() {
        let json = r#"{
            "winner_index": -1,
            "merge_strategy": "merge",
            "reasoning": "none usable alone",
            "attempt_evaluations": []
        }"#;
        let payload: EvaluationPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.winner_index, -1);
        assert_eq!(payload.merge_strategy, MergeStrategy::Merge);
    }

    #[test]
    fn ralph_status_round_trip() {
        let payload = RalphStatusPayload {
            iteration: 3,
            phase: "working".to_string(),
            promise_found: false,
            last_activity: "editing tests".to_string(),
            commit_count: 7,
            files_modified: vec!["src/loop.rs".to_string()],
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: RalphStatusPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
