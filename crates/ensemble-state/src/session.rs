//! The session root aggregate and per-mode payloads.
//!
//! A [`Session`] is the serializable state of one workflow run. It is
//! mutated only by the phase dispatcher and the task scheduler, persisted
//! on every externally observable transition, and restored verbatim on
//! recovery. Collections use `BTreeMap`/`BTreeSet` so that a save/restore
//! cycle reproduces the exact same document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{Phase, WorkflowMode};
use crate::plan::Plan;
use crate::sentinels::{EvaluationPayload, IncrementPayload, ReviewPayload};

/// Default minimum passing score for adversarial reviews. Out-of-range or
/// otherwise invalid configured minimums fall back to this value.
pub const DEFAULT_MINIMUM_SCORE: i64 = 8;

/// Clamp a configured minimum passing score into the valid [1, 10] range.
///
/// Values outside the range are treated as misconfiguration and replaced
/// with [`DEFAULT_MINIMUM_SCORE`].
pub fn effective_minimum_score(raw: i64) -> i64 {
    if (1..=10).contains(&raw) {
        raw
    } else {
        DEFAULT_MINIMUM_SCORE
    }
}

/// Configuration record carried by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the repository the agents operate on.
    pub repo_path: PathBuf,
    /// Branch that group 0 tasks are rooted on.
    pub base_branch: String,
    /// Prefix for all branches created by this session.
    pub branch_prefix: String,
    /// Maximum number of concurrently running agents.
    pub max_parallel: usize,
    /// Retry cap for tasks that complete without commits.
    pub retry_cap: u32,
    /// Wall-time limit per agent, in seconds.
    pub agent_timeout_secs: u64,
    /// When false, a completed agent is credited without a commit check.
    pub verify_commits: bool,
    /// When true, group consolidation is delegated to a consolidator agent.
    pub delegated_consolidation: bool,
    /// Number of planner agents to run; more than one enables the
    /// plan-selection phase.
    pub plan_candidates: u32,
    /// Cap on synthesis/revision cycles.
    pub max_revision_rounds: u32,
    /// Whether consolidated branches are pushed (best-effort).
    pub push_branches: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            base_branch: "main".to_string(),
            branch_prefix: "ensemble".to_string(),
            max_parallel: 4,
            retry_cap: 2,
            agent_timeout_secs: 1800,
            verify_commits: true,
            delegated_consolidation: false,
            plan_candidates: 1,
            max_revision_rounds: 3,
            push_branches: true,
        }
    }
}

/// Per-task retry bookkeeping.
///
/// `retry_count` counts attempts that produced no commits; it is what the
/// cap limits. `commit_counts` records the observed commit count of every
/// finished attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub cap: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub commit_counts: Vec<u32>,
}

impl RetryState {
    pub fn new(cap: u32) -> Self {
        Self {
            retry_count: 0,
            cap,
            last_error: None,
            commit_counts: Vec::new(),
        }
    }

    /// Record an attempt that produced no commits. Counts against the cap.
    pub fn record_empty(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.commit_counts.push(0);
        self.last_error = Some(error.into());
    }

    /// Record a verified successful attempt.
    pub fn record_success(&mut self, commits: u32) {
        self.commit_counts.push(commits);
        self.last_error = None;
    }

    /// Whether one more empty result may still be retried. The next empty
    /// result would bring the count to `retry_count + 1`, which must stay
    /// within the cap.
    pub fn retries_left(&self) -> bool {
        self.retry_count < self.cap
    }
}

/// Decision record created when a group finishes with a mix of succeeded
/// and failed tasks. While `awaiting_decision` is set, the scheduler's
/// ready set is empty and the group cursor does not advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDecision {
    pub group_index: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub awaiting_decision: bool,
    pub created_at: DateTime<Utc>,
}

/// Ultra-plan payload: the plan, the execution cursor, and all per-task
/// scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UltraPlanState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Candidate plans collected while more than one planner ran; drained
    /// when one is selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_plans: Vec<Plan>,
    /// Index of the group currently executing.
    pub current_group: usize,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    /// Task id -> live instance id.
    pub running: BTreeMap<String, Uuid>,
    pub retries: BTreeMap<String, RetryState>,
    /// Verified commit count per completed task.
    pub task_commit_counts: BTreeMap<String, u32>,
    /// Consolidated branch name per closed group, in group order.
    pub group_branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_decision: Option<GroupDecision>,
    pub revision_round: u32,
    /// Final branch offered at the end of consolidation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_branch: Option<String>,
}

impl UltraPlanState {
    /// Number of tasks that have reached a terminal state.
    pub fn resolved_count(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// One implementer/reviewer round in an adversarial session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialRound {
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<IncrementPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewPayload>,
}

/// Adversarial payload: task text, round bookkeeping, score gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialState {
    pub task: String,
    /// 1-based index of the round currently running.
    pub round: u32,
    pub round_cap: u32,
    /// Raw configured minimum; clamp through [`effective_minimum_score`]
    /// before comparing.
    pub minimum_passing_score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub rounds: Vec<AdversarialRound>,
}

impl AdversarialState {
    pub fn new(task: impl Into<String>, round_cap: u32, minimum_passing_score: i64) -> Self {
        Self {
            task: task.into(),
            round: 1,
            round_cap,
            minimum_passing_score,
            worktree: None,
            branch: None,
            rounds: Vec::new(),
        }
    }

    /// The clamped score threshold reviews are held against.
    pub fn effective_minimum(&self) -> i64 {
        effective_minimum_score(self.minimum_passing_score)
    }

    /// The review from the round before `round`, if any. Used to feed the
    /// previous round's required changes into the next implementer prompt.
    pub fn previous_review(&self) -> Option<&ReviewPayload> {
        if self.round < 2 {
            return None;
        }
        self.rounds
            .iter()
            .find(|r| r.round == self.round - 1)
            .and_then(|r| r.review.as_ref())
    }
}

/// One pass of the iterative loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub had_commits: bool,
}

/// Iterative-loop payload: prompt, completion phrase, iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterativeState {
    pub prompt: String,
    pub completion_phrase: String,
    pub iteration_cap: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    pub iterations: Vec<IterationRecord>,
}

impl IterativeState {
    pub fn new(
        prompt: impl Into<String>,
        completion_phrase: impl Into<String>,
        iteration_cap: u32,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            completion_phrase: completion_phrase.into(),
            iteration_cap,
            instance: None,
            worktree: None,
            iterations: Vec::new(),
        }
    }
}

/// Status of one triple-shot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One of the three independent triple-shot attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl AttemptRecord {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            worktree: None,
            branch: None,
            status: AttemptStatus::Pending,
            instance: None,
            started_at: None,
            completed_at: None,
            summary: None,
        }
    }
}

/// Triple-shot payload: the task, three attempts, and the judge's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleShotState {
    pub task: String,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_branch: Option<String>,
}

impl TripleShotState {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            attempts: (0..3).map(AttemptRecord::new).collect(),
            evaluation: None,
            winning_branch: None,
        }
    }
}

/// Mode-specific payload of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModePayload {
    UltraPlan(UltraPlanState),
    Adversarial(AdversarialState),
    Iterative(IterativeState),
    TripleShot(TripleShotState),
}

impl ModePayload {
    /// The workflow mode this payload belongs to.
    pub fn mode(&self) -> WorkflowMode {
        match self {
            Self::UltraPlan(_) => WorkflowMode::UltraPlan,
            Self::Adversarial(_) => WorkflowMode::Adversarial,
            Self::Iterative(_) => WorkflowMode::Iterative,
            Self::TripleShot(_) => WorkflowMode::TripleShot,
        }
    }

    /// The phase a fresh session of this mode starts in.
    pub fn initial_phase(&self) -> Phase {
        match self {
            Self::UltraPlan(_) => Phase::Planning,
            Self::Adversarial(_) => Phase::Implementing,
            Self::Iterative(_) | Self::TripleShot(_) => Phase::Working,
        }
    }
}

/// The root aggregate of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// The user's original objective, free text.
    pub objective: String,
    pub phase: Phase,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: ModePayload,
}

impl Session {
    /// Create a new session in its mode's initial phase.
    pub fn new(objective: impl Into<String>, config: SessionConfig, payload: ModePayload) -> Self {
        let phase = payload.initial_phase();
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            phase,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            payload,
        }
    }

    pub fn mode(&self) -> WorkflowMode {
        self.payload.mode()
    }

    /// Short id used in branch names: the first 8 hex chars of the uuid.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Borrow the ultra-plan payload, if this is an ultra-plan session.
    pub fn ultra(&self) -> Option<&UltraPlanState> {
        match &self.payload {
            ModePayload::UltraPlan(s) => Some(s),
            _ => None,
        }
    }

    /// Mutably borrow the ultra-plan payload.
    pub fn ultra_mut(&mut self) -> Option<&mut UltraPlanState> {
        match &mut self.payload {
            ModePayload::UltraPlan(s) => Some(s),
            _ => None,
        }
    }

    pub fn adversarial(&self) -> Option<&AdversarialState> {
        match &self.payload {
            ModePayload::Adversarial(s) => Some(s),
            _ => None,
        }
    }

    pub fn adversarial_mut(&mut self) -> Option<&mut AdversarialState> {
        match &mut self.payload {
            ModePayload::Adversarial(s) => Some(s),
            _ => None,
        }
    }

    pub fn iterative(&self) -> Option<&IterativeState> {
        match &self.payload {
            ModePayload::Iterative(s) => Some(s),
            _ => None,
        }
    }

    pub fn iterative_mut(&mut self) -> Option<&mut IterativeState> {
        match &mut self.payload {
            ModePayload::Iterative(s) => Some(s),
            _ => None,
        }
    }

    pub fn tripleshot(&self) -> Option<&TripleShotState> {
        match &self.payload {
            ModePayload::TripleShot(s) => Some(s),
            _ => None,
        }
    }

    pub fn tripleshot_mut(&mut self) -> Option<&mut TripleShotState> {
        match &mut self.payload {
            ModePayload::TripleShot(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_minimum_clamps_out_of_range_values() {
        assert_eq!(effective_minimum_score(0), 8);
        assert_eq!(effective_minimum_score(11), 8);
        assert_eq!(effective_minimum_score(-3), 8);
        assert_eq!(effective_minimum_score(1), 1);
        assert_eq!(effective_minimum_score(10), 10);
        assert_eq!(effective_minimum_score(9), 9);
    }

    #[test]
    fn new_session_starts_in_mode_initial_phase() {
        let config = SessionConfig::default();
        let s = Session::new(
            "build the thing",
            config.clone(),
            ModePayload::UltraPlan(UltraPlanState::default()),
        );
        assert_eq!(s.phase, Phase::Planning);
        assert_eq!(s.mode(), WorkflowMode::UltraPlan);
        assert!(s.started_at.is_none());
        assert!(s.error.is_none());

        let s = Session::new(
            "fix the bug",
            config,
            ModePayload::Adversarial(AdversarialState::new("fix the bug", 5, 8)),
        );
        assert_eq!(s.phase, Phase::Implementing);
    }

    #[test]
    fn short_id_is_eight_hex_chars() {
        let s = Session::new(
            "x",
            SessionConfig::default(),
            ModePayload::Iterative(IterativeState::new("p", "DONE", 50)),
        );
        let short = s.short_id();
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn retry_state_counts_empty_results_against_cap() {
        let mut r = RetryState::new(2);
        assert!(r.retries_left());

        r.record_empty("produced no commits");
        assert_eq!(r.retry_count, 1);
        assert!(r.retries_left());

        r.record_empty("produced no commits");
        assert_eq!(r.retry_count, 2);
        assert!(!r.retries_left());
        assert_eq!(r.commit_counts, vec![0, 0]);
        assert_eq!(r.last_error.as_deref(), Some("produced no commits"));
    }

    #[test]
    fn retry_cap_zero_leaves_no_retries() {
        let r = RetryState::new(0);
        assert!(!r.retries_left());
    }

    #[test]
    fn successful_attempt_does_not_count_against_cap() {
        let mut r = RetryState::new(3);
        r.record_empty("produced no commits");
        r.record_success(2);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.commit_counts, vec![0, 2]);
        assert!(r.last_error.is_none());
    }

    #[test]
    fn previous_review_for_round_one_is_none() {
        let state = AdversarialState::new("task", 5, 8);
        assert!(state.previous_review().is_none());
    }

    #[test]
    fn previous_review_finds_prior_round() {
        use crate::sentinels::ReviewPayload;

        let mut state = AdversarialState::new("task", 5, 8);
        state.rounds.push(AdversarialRound {
            round: 1,
            increment: None,
            review: Some(ReviewPayload {
                round: 1,
                approved: false,
                score: 5,
                summary: "needs work".to_string(),
                required_changes: vec!["add tests".to_string()],
            }),
        });
        state.round = 2;

        let prev = state.previous_review().expect("round 1 review");
        assert_eq!(prev.round, 1);
        assert_eq!(prev.required_changes, vec!["add tests".to_string()]);
    }

    #[test]
    fn tripleshot_starts_with_three_pending_attempts() {
        let state = TripleShotState::new("task");
        assert_eq!(state.attempts.len(), 3);
        assert!(
            state
                .attempts
                .iter()
                .all(|a| a.status == AttemptStatus::Pending)
        );
        assert_eq!(state.attempts[2].index, 2);
    }

    #[test]
    fn session_json_round_trip_is_stable() {
        let mut ultra = UltraPlanState::default();
        ultra.completed.insert("a".to_string());
        ultra.running.insert("b".to_string(), Uuid::new_v4());
        ultra
            .retries
            .insert("b".to_string(), RetryState::new(2));
        ultra.group_branches.push("ensemble/abc123/group-1".to_string());

        let session = Session::new(
            "objective",
            SessionConfig::default(),
            ModePayload::UltraPlan(ultra),
        );

        let first = serde_json::to_string_pretty(&session).unwrap();
        let restored: Session = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&restored).unwrap();
        assert_eq!(first, second);
        assert_eq!(restored, session);
    }
}
