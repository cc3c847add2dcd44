//! Driver integration tests: adversarial rounds, the iterative promise
//! loop, triple-shot judging, and the full ultra-plan flow, all against
//! the scripted fake broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ensemble_core::broker::{InstanceBroker, InstanceStatus};
use ensemble_core::dispatcher::SessionHandle;
use ensemble_core::drivers::adversarial::AdversarialDriver;
use ensemble_core::drivers::iterative::IterativeDriver;
use ensemble_core::drivers::tripleshot::TripleShotDriver;
use ensemble_core::drivers::ultraplan::UltraPlanDriver;
use ensemble_core::git::GitRepo;
use ensemble_core::observer::NoopObserver;
use ensemble_core::scheduler::SchedulerConfig;
use ensemble_state::phase::Phase;
use ensemble_state::session::{
    AdversarialState, AttemptStatus, IterativeState, ModePayload, Session, SessionConfig,
    TripleShotState, UltraPlanState,
};
use ensemble_state::store::{MemorySessionStore, SessionStore};

use common::{FakeBroker, Script, task_complete_body, temp_repo};

struct Fixture {
    git: Arc<GitRepo>,
    broker: Arc<FakeBroker>,
    store: Arc<MemorySessionStore>,
    repo: std::path::PathBuf,
    _repo_dir: tempfile::TempDir,
    _wt_dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let (_repo_dir, repo) = temp_repo();
    let _wt_dir = tempfile::TempDir::new().unwrap();
    let git = Arc::new(GitRepo::open(&repo, Some(_wt_dir.path().to_path_buf())).unwrap());
    let broker = Arc::new(FakeBroker::new(git.as_ref().clone()));
    Fixture {
        git,
        broker,
        store: Arc::new(MemorySessionStore::new()),
        repo,
        _repo_dir,
        _wt_dir,
    }
}

impl Fixture {
    fn handle(&self, session: Session) -> SessionHandle {
        SessionHandle::new(
            session,
            Arc::clone(&self.store) as _,
            Arc::new(NoopObserver),
        )
    }

    fn config(&self) -> SessionConfig {
        SessionConfig {
            repo_path: self.repo.clone(),
            push_branches: false,
            ..Default::default()
        }
    }

    fn broker_dyn(&self) -> Arc<dyn InstanceBroker> {
        Arc::clone(&self.broker) as _
    }
}

fn increment_body(round: u32) -> String {
    format!(r#"{{"round": {round}, "status": "complete", "summary": "increment {round}"}}"#)
}

fn review_body(round: u32, approved: bool, score: i64, changes: &str) -> String {
    format!(
        r#"{{"round": {round}, "approved": {approved}, "score": {score}, "summary": "review {round}", "required_changes": {changes}}}"#
    )
}

// ---------------------------------------------------------------------------
// Adversarial
// ---------------------------------------------------------------------------

#[tokio::test]
async fn adversarial_approval_below_minimum_is_overridden_into_round_two() {
    let f = fixture();

    // Minimum score 9. Round 1's review claims approval at 8: overridden.
    let session = Session::new(
        "fix the parser",
        f.config(),
        ModePayload::Adversarial(AdversarialState::new("fix the parser", 5, 9)),
    );
    let handle = f.handle(session);

    f.broker.script(
        "implementer-1",
        Script::new().sentinel("adversarial-increment.json", increment_body(1)),
    );
    f.broker.script(
        "reviewer-1",
        Script::new().sentinel(
            "adversarial-review.json",
            review_body(1, true, 8, "[]"),
        ),
    );
    f.broker.script(
        "implementer-2",
        Script::new().sentinel("adversarial-increment.json", increment_body(2)),
    );
    f.broker.script(
        "reviewer-2",
        Script::new().sentinel(
            "adversarial-review.json",
            review_body(2, true, 9, "[]"),
        ),
    );

    let driver = AdversarialDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Complete);

    handle.with_read(|s| {
        let adv = s.adversarial().unwrap();
        assert_eq!(adv.round, 2);

        let round1 = adv.rounds.iter().find(|r| r.round == 1).unwrap();
        let review1 = round1.review.as_ref().unwrap();
        assert!(!review1.approved, "round 1 approval must be overridden");
        assert_eq!(review1.required_changes.len(), 1);
        assert!(review1.required_changes[0].contains('8'));
        assert!(review1.required_changes[0].contains('9'));

        let round2 = adv.rounds.iter().find(|r| r.round == 2).unwrap();
        assert!(round2.review.as_ref().unwrap().approved);
        assert!(s.completed_at.is_some());
    });
}

#[tokio::test]
async fn adversarial_round_cap_fails_the_session() {
    let f = fixture();
    let session = Session::new(
        "impossible task",
        f.config(),
        ModePayload::Adversarial(AdversarialState::new("impossible task", 2, 8)),
    );
    let handle = f.handle(session);

    for round in 1..=2u32 {
        f.broker.script(
            &format!("implementer-{round}"),
            Script::new().sentinel("adversarial-increment.json", increment_body(round)),
        );
        f.broker.script(
            &format!("reviewer-{round}"),
            Script::new().sentinel(
                "adversarial-review.json",
                review_body(round, false, 4, r#"["rewrite everything"]"#),
            ),
        );
    }

    let driver = AdversarialDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
    handle.with_read(|s| {
        assert!(s.error.as_deref().unwrap().contains("round cap"));
        // Both rounds recorded with their reviews.
        assert_eq!(s.adversarial().unwrap().rounds.len(), 2);
    });
}

#[tokio::test]
async fn adversarial_implementer_failure_is_terminal() {
    let f = fixture();
    let session = Session::new(
        "task",
        f.config(),
        ModePayload::Adversarial(AdversarialState::new("task", 5, 8)),
    );
    let handle = f.handle(session);

    f.broker.script(
        "implementer-1",
        Script::new().sentinel(
            "adversarial-increment.json",
            r#"{"round": 1, "status": "failed", "summary": "cannot proceed"}"#,
        ),
    );

    let driver = AdversarialDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
    handle.with_read(|s| {
        assert!(s.error.as_deref().unwrap().contains("round 1"));
    });
}

// ---------------------------------------------------------------------------
// Iterative loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn iterative_loop_completes_when_promise_appears() {
    let f = fixture();
    let session = Session::new(
        "keep refactoring",
        f.config(),
        ModePayload::Iterative(IterativeState::new("keep refactoring", "DONE", 50)),
    );
    let handle = f.handle(session);

    // Iterations 1 and 2 idle without the phrase; iteration 3 commits and
    // emits the promise with extra whitespace inside the tags.
    f.broker.script(
        "loop",
        Script::new()
            .output("iteration one, no luck\n")
            .settle(InstanceStatus::WaitingForInput),
    );
    f.broker.script(
        "loop",
        Script::new()
            .commit("progress.txt", "halfway\n")
            .output("iteration two, getting closer\n")
            .settle(InstanceStatus::WaitingForInput),
    );
    f.broker.script(
        "loop",
        Script::new()
            .output("all finished: <promise> DONE </promise>\n")
            .settle(InstanceStatus::WaitingForInput),
    );

    let driver = IterativeDriver::new(handle.clone(), f.broker_dyn(), Arc::clone(&f.git))
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Complete);
    handle.with_read(|s| {
        let iter = s.iterative().unwrap();
        assert_eq!(iter.iterations.len(), 3);
        assert!(iter.iterations[1].had_commits);
        assert!(!iter.iterations[0].had_commits);
    });
}

#[tokio::test]
async fn iterative_loop_stops_at_iteration_cap() {
    let f = fixture();
    let session = Session::new(
        "never finishes",
        f.config(),
        ModePayload::Iterative(IterativeState::new("never finishes", "DONE", 2)),
    );
    let handle = f.handle(session);

    for _ in 0..2 {
        f.broker.script(
            "loop",
            Script::new()
                .output("still going\n")
                .settle(InstanceStatus::WaitingForInput),
        );
    }

    let driver = IterativeDriver::new(handle.clone(), f.broker_dyn(), Arc::clone(&f.git))
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::MaxIterations);
    handle.with_read(|s| {
        assert_eq!(s.iterative().unwrap().iterations.len(), 2);
        assert!(s.completed_at.is_some());
    });
}

#[tokio::test]
async fn iterative_loop_fails_when_agent_dies() {
    let f = fixture();
    let session = Session::new(
        "crashy",
        f.config(),
        ModePayload::Iterative(IterativeState::new("crashy", "DONE", 10)),
    );
    let handle = f.handle(session);

    f.broker.script(
        "loop",
        Script::new().output("dying\n").settle(InstanceStatus::Error),
    );

    let driver = IterativeDriver::new(handle.clone(), f.broker_dyn(), Arc::clone(&f.git))
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
}

// ---------------------------------------------------------------------------
// Triple-shot
// ---------------------------------------------------------------------------

fn attempt_body(index: u32) -> String {
    format!(
        r#"{{"attempt_index": {index}, "status": "complete", "summary": "approach {index}", "files_modified": [], "approach": "approach {index}"}}"#
    )
}

#[tokio::test]
async fn tripleshot_judge_selects_attempt_one() {
    let f = fixture();
    let session = Session::new(
        "speed up the query",
        f.config(),
        ModePayload::TripleShot(TripleShotState::new("speed up the query")),
    );
    let handle = f.handle(session);

    for index in 0..3u32 {
        f.broker.script(
            &format!("attempt-{index}"),
            Script::new()
                .commit(&format!("attempt{index}.txt"), "work\n")
                .sentinel("tripleshot-complete.json", attempt_body(index)),
        );
    }
    f.broker.script(
        "judge",
        Script::new().sentinel(
            "tripleshot-evaluation.json",
            r#"{
                "winner_index": 1,
                "merge_strategy": "select",
                "reasoning": "attempt 1 is cleanest",
                "attempt_evaluations": [
                    {"attempt_index": 0, "score": 6},
                    {"attempt_index": 1, "score": 9},
                    {"attempt_index": 2, "score": 5}
                ]
            }"#,
        ),
    );

    let driver = TripleShotDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Complete);
    handle.with_read(|s| {
        let ts = s.tripleshot().unwrap();
        assert!(ts.attempts.iter().all(|a| a.status == AttemptStatus::Complete));

        let winner = ts.winning_branch.as_deref().expect("winning branch");
        assert_eq!(winner, ts.attempts[1].branch.as_deref().unwrap());
        assert!(winner.ends_with("attempt-1"));

        let evaluation = ts.evaluation.as_ref().unwrap();
        assert_eq!(evaluation.winner_index, 1);
        assert_eq!(evaluation.attempt_evaluations.len(), 3);
    });
}

#[tokio::test]
async fn tripleshot_failed_attempt_is_recorded_and_judged() {
    let f = fixture();
    let session = Session::new(
        "task",
        f.config(),
        ModePayload::TripleShot(TripleShotState::new("task")),
    );
    let handle = f.handle(session);

    f.broker.script(
        "attempt-0",
        Script::new().sentinel(
            "tripleshot-complete.json",
            r#"{"attempt_index": 0, "status": "failed", "summary": "dead end", "files_modified": [], "approach": "wrong turn"}"#,
        ),
    );
    for index in 1..3u32 {
        f.broker.script(
            &format!("attempt-{index}"),
            Script::new()
                .commit(&format!("attempt{index}.txt"), "work\n")
                .sentinel("tripleshot-complete.json", attempt_body(index)),
        );
    }
    f.broker.script(
        "judge",
        Script::new().sentinel(
            "tripleshot-evaluation.json",
            r#"{"winner_index": 2, "merge_strategy": "select", "reasoning": "only solid one", "attempt_evaluations": []}"#,
        ),
    );

    let driver = TripleShotDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Complete);
    handle.with_read(|s| {
        let ts = s.tripleshot().unwrap();
        assert_eq!(ts.attempts[0].status, AttemptStatus::Failed);
        assert_eq!(
            ts.winning_branch.as_deref(),
            ts.attempts[2].branch.as_deref()
        );
    });
}

#[tokio::test]
async fn tripleshot_no_usable_attempt_fails_the_session() {
    let f = fixture();
    let session = Session::new(
        "task",
        f.config(),
        ModePayload::TripleShot(TripleShotState::new("task")),
    );
    let handle = f.handle(session);

    for index in 0..3u32 {
        f.broker.script(
            &format!("attempt-{index}"),
            Script::new().sentinel("tripleshot-complete.json", attempt_body(index)),
        );
    }
    f.broker.script(
        "judge",
        Script::new().sentinel(
            "tripleshot-evaluation.json",
            r#"{"winner_index": -1, "merge_strategy": "select", "reasoning": "all broken", "attempt_evaluations": []}"#,
        ),
    );

    let driver = TripleShotDriver::new(handle.clone(), f.broker_dyn())
        .with_poll_interval(Duration::from_millis(20));
    driver.run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
    handle.with_read(|s| {
        assert!(s.tripleshot().unwrap().winning_branch.is_none());
    });
}

// ---------------------------------------------------------------------------
// Ultra-plan end to end
// ---------------------------------------------------------------------------

fn plan_body() -> String {
    r#"{
        "summary": "two tasks",
        "tasks": [
            {"id": "a", "title": "A", "description": "do a", "files": [],
             "depends_on": [], "priority": 0, "est_complexity": "low"},
            {"id": "b", "title": "B", "description": "do b", "files": [],
             "depends_on": ["a"], "priority": 0, "est_complexity": "low"}
        ],
        "insights": ["repo is small"],
        "constraints": []
    }"#
    .to_string()
}

fn synthesis_clean_body() -> String {
    r#"{
        "status": "complete",
        "revision_round": 0,
        "issues_found": [],
        "tasks_affected": [],
        "integration_notes": "fits together",
        "recommendations": []
    }"#
    .to_string()
}

fn fast_driver(handle: &SessionHandle, f: &Fixture) -> UltraPlanDriver {
    UltraPlanDriver::new(handle.clone(), f.broker_dyn(), Arc::clone(&f.git))
        .with_poll_interval(Duration::from_millis(20))
        .with_scheduler_config(SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(20),
        })
}

#[tokio::test]
async fn ultraplan_full_run_plans_executes_and_consolidates() {
    let f = fixture();
    let session = Session::new(
        "build the feature",
        f.config(),
        ModePayload::UltraPlan(UltraPlanState::default()),
    );
    let handle = f.handle(session);

    f.broker
        .script("planner", Script::new().sentinel("plan.json", plan_body()));
    f.broker.script(
        "a",
        Script::new()
            .commit("a.txt", "a work\n")
            .sentinel("task-complete.json", task_complete_body("a")),
    );
    f.broker.script(
        "b",
        Script::new()
            .commit("b.txt", "b work\n")
            .sentinel("task-complete.json", task_complete_body("b")),
    );
    f.broker.script(
        "synthesis",
        Script::new().sentinel("synthesis-complete.json", synthesis_clean_body()),
    );

    let outcome = fast_driver(&handle, &f).run().await.unwrap();
    assert_eq!(
        outcome,
        ensemble_core::drivers::ultraplan::RunOutcome::Finished
    );
    assert_eq!(handle.phase(), Phase::Complete);

    handle.with_read(|s| {
        let u = s.ultra().unwrap();
        assert_eq!(u.plan.as_ref().unwrap().execution_order.len(), 2);
        assert_eq!(u.group_branches.len(), 2);
        assert_eq!(u.completed.len(), 2);
        assert!(u.final_branch.as_deref().unwrap().ends_with("integration"));
    });

    // The session was persisted along the way and is restorable.
    let stored = f.store.load(handle.id()).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Complete);
}

#[tokio::test]
async fn ultraplan_revision_round_runs_before_completion() {
    let f = fixture();
    let session = Session::new(
        "build it well",
        f.config(),
        ModePayload::UltraPlan(UltraPlanState::default()),
    );
    let handle = f.handle(session);

    f.broker
        .script("planner", Script::new().sentinel("plan.json", plan_body()));
    for task in ["a", "b"] {
        f.broker.script(
            task,
            Script::new()
                .commit(&format!("{task}.txt"), "work\n")
                .sentinel("task-complete.json", task_complete_body(task)),
        );
    }
    // First synthesis pass finds a major issue in task a.
    f.broker.script(
        "synthesis",
        Script::new().sentinel(
            "synthesis-complete.json",
            r#"{
                "status": "needs_revision",
                "revision_round": 0,
                "issues_found": [
                    {"severity": "major", "description": "a breaks b's API", "task_id": "a"}
                ],
                "tasks_affected": ["a"],
                "integration_notes": "one clash",
                "recommendations": []
            }"#,
        ),
    );
    f.broker.script(
        "revision-a",
        Script::new()
            .commit("a-fix.txt", "fixed\n")
            .sentinel(
                "revision-complete.json",
                r#"{
                    "task_id": "a",
                    "revision_round": 1,
                    "issues_addressed": ["a breaks b's API"],
                    "summary": "aligned the API",
                    "files_modified": ["a-fix.txt"],
                    "remaining_issues": []
                }"#,
            ),
    );
    // Second synthesis pass is clean.
    f.broker.script(
        "synthesis",
        Script::new().sentinel("synthesis-complete.json", synthesis_clean_body()),
    );

    fast_driver(&handle, &f).run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Complete);
    handle.with_read(|s| {
        let u = s.ultra().unwrap();
        assert_eq!(u.revision_round, 1);
    });

    // The revision commit landed on the integration branch.
    let final_branch = handle.with_read(|s| s.ultra().unwrap().final_branch.clone().unwrap());
    let last_group = handle.with_read(|s| s.ultra().unwrap().group_branches.last().cloned().unwrap());
    assert_eq!(
        f.git
            .count_commits_between(&last_group, &final_branch)
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn ultraplan_rejects_a_cyclic_plan() {
    let f = fixture();
    let session = Session::new(
        "impossible ordering",
        f.config(),
        ModePayload::UltraPlan(UltraPlanState::default()),
    );
    let handle = f.handle(session);

    f.broker.script(
        "planner",
        Script::new().sentinel(
            "plan.json",
            r#"{
                "summary": "cycle",
                "tasks": [
                    {"id": "a", "title": "A", "description": "a", "files": [],
                     "depends_on": ["b"], "priority": 0, "est_complexity": "low"},
                    {"id": "b", "title": "B", "description": "b", "files": [],
                     "depends_on": ["a"], "priority": 0, "est_complexity": "low"}
                ],
                "insights": [],
                "constraints": []
            }"#,
        ),
    );

    fast_driver(&handle, &f).run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
    handle.with_read(|s| {
        assert!(s.error.as_deref().unwrap().contains("cycle"));
    });
}

#[tokio::test]
async fn ultraplan_malformed_plan_sentinel_fails_the_phase() {
    let f = fixture();
    let session = Session::new(
        "bad planner",
        f.config(),
        ModePayload::UltraPlan(UltraPlanState::default()),
    );
    let handle = f.handle(session);

    f.broker.script(
        "planner",
        Script::new().sentinel("plan.json", "this is not json {{"),
    );

    fast_driver(&handle, &f).run().await.unwrap();

    assert_eq!(handle.phase(), Phase::Failed);
    handle.with_read(|s| {
        assert!(s.error.as_deref().unwrap().contains("plan sentinel"));
    });
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restore_requeues_tasks_whose_instances_vanished() {
    use ensemble_core::recover::restore_session;
    use uuid::Uuid;

    let f = fixture();
    let mut ultra = UltraPlanState::default();
    // A running mapping pointing at an instance the broker never knew.
    ultra.running.insert("a".to_string(), Uuid::new_v4());

    let session = Session::new("restore me", f.config(), ModePayload::UltraPlan(ultra));
    let id = session.id;
    f.store.save(&session).await.unwrap();

    let handle = restore_session(
        Arc::clone(&f.store) as _,
        id,
        f.broker.as_ref(),
        Arc::new(NoopObserver),
    )
    .await
    .unwrap();

    handle.with_read(|s| {
        let u = s.ultra().unwrap();
        assert!(u.running.is_empty(), "vanished instance must leave running");
        // Default retry cap leaves retries: the task is requeued, not failed.
        assert!(!u.failed.contains("a"));
        assert_eq!(u.retries["a"].retry_count, 1);
        assert_eq!(
            u.retries["a"].last_error.as_deref(),
            Some("instance not found")
        );
    });
}

#[tokio::test]
async fn restore_round_trip_preserves_the_document() {
    use ensemble_core::recover::restore_session;

    let f = fixture();
    let session = Session::new(
        "round trip",
        f.config(),
        ModePayload::Iterative(IterativeState::new("p", "DONE", 5)),
    );
    let id = session.id;
    f.store.save(&session).await.unwrap();

    let handle = restore_session(
        Arc::clone(&f.store) as _,
        id,
        f.broker.as_ref(),
        Arc::new(NoopObserver),
    )
    .await
    .unwrap();

    let restored = handle.with_read(|s| s.clone());
    assert_eq!(restored, session);
}
