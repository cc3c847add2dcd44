//! Console observer: prints workflow progress to stdout.

use uuid::Uuid;

use ensemble_core::observer::WorkflowObserver;
use ensemble_state::phase::Phase;
use ensemble_state::session::GroupDecision;

/// Prints one line per workflow event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleObserver;

impl WorkflowObserver for ConsoleObserver {
    fn on_phase_change(&self, _session_id: Uuid, from: Phase, to: Phase) {
        println!("phase: {from} -> {to}");
    }

    fn on_task_started(&self, _session_id: Uuid, task_id: &str, _instance: Uuid) {
        println!("task {task_id}: started");
    }

    fn on_task_completed(&self, _session_id: Uuid, task_id: &str, commits: u32) {
        println!("task {task_id}: completed ({commits} commits)");
    }

    fn on_task_failed(&self, _session_id: Uuid, task_id: &str, reason: &str) {
        println!("task {task_id}: FAILED ({reason})");
    }

    fn on_group_decision(&self, session_id: Uuid, decision: &GroupDecision) {
        println!(
            "group {} finished with mixed results: {} succeeded, {} failed",
            decision.group_index + 1,
            decision.succeeded.len(),
            decision.failed.len()
        );
        println!("  succeeded: {}", decision.succeeded.join(", "));
        println!("  failed:    {}", decision.failed.join(", "));
        println!(
            "resolve with `ensemble decide {session_id} --resume-partial` or `--retry-failed`"
        );
    }

    fn on_group_consolidated(&self, _session_id: Uuid, group_index: usize, branch: &str) {
        println!("group {} consolidated onto {branch}", group_index + 1);
    }

    fn on_finished(&self, _session_id: Uuid, success: bool, summary: &str) {
        if success {
            println!("workflow finished: {summary}");
        } else {
            println!("workflow FAILED: {summary}");
        }
    }
}
