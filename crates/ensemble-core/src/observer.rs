//! Observer interface for workflow events.
//!
//! The display layer registers one observer per workflow instead of a
//! struct of callbacks. Every method has a default no-op body so
//! observers implement only what they care about. The coordinator calls
//! observers *without* the session lock held; a slow observer delays only
//! its own consumer, never the dispatcher.

use uuid::Uuid;

use ensemble_state::phase::Phase;
use ensemble_state::session::GroupDecision;

/// Workflow event callbacks. All methods default to no-ops.
pub trait WorkflowObserver: Send + Sync {
    /// A phase transition committed (already persisted).
    fn on_phase_change(&self, _session_id: Uuid, _from: Phase, _to: Phase) {}

    /// A task was dispatched to an agent instance.
    fn on_task_started(&self, _session_id: Uuid, _task_id: &str, _instance: Uuid) {}

    /// A task completed with verified commits.
    fn on_task_completed(&self, _session_id: Uuid, _task_id: &str, _commits: u32) {}

    /// A task failed terminally (retries exhausted or agent failure).
    fn on_task_failed(&self, _session_id: Uuid, _task_id: &str, _reason: &str) {}

    /// A group finished with mixed results and needs an external decision.
    fn on_group_decision(&self, _session_id: Uuid, _decision: &GroupDecision) {}

    /// A group was consolidated onto a branch.
    fn on_group_consolidated(&self, _session_id: Uuid, _group_index: usize, _branch: &str) {}

    /// The workflow reached a terminal phase. Called exactly once.
    fn on_finished(&self, _session_id: Uuid, _success: bool, _summary: &str) {}
}

/// The do-nothing observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap_or_else(|e| e.into_inner()))
        }

        fn push(&self, event: String) {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        }
    }

    impl WorkflowObserver for RecordingObserver {
        fn on_phase_change(&self, _session_id: Uuid, from: Phase, to: Phase) {
            self.push(format!("phase:{from}->{to}"));
        }

        fn on_task_started(&self, _session_id: Uuid, task_id: &str, _instance: Uuid) {
            self.push(format!("started:{task_id}"));
        }

        fn on_task_completed(&self, _session_id: Uuid, task_id: &str, commits: u32) {
            self.push(format!("completed:{task_id}:{commits}"));
        }

        fn on_task_failed(&self, _session_id: Uuid, task_id: &str, reason: &str) {
            self.push(format!("failed:{task_id}:{reason}"));
        }

        fn on_group_decision(&self, _session_id: Uuid, decision: &GroupDecision) {
            self.push(format!(
                "decision:group-{}:ok={},bad={}",
                decision.group_index,
                decision.succeeded.len(),
                decision.failed.len()
            ));
        }

        fn on_group_consolidated(&self, _session_id: Uuid, group_index: usize, branch: &str) {
            self.push(format!("consolidated:{group_index}:{branch}"));
        }

        fn on_finished(&self, _session_id: Uuid, success: bool, summary: &str) {
            self.push(format!("finished:{success}:{summary}"));
        }
    }
}
