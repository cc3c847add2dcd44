//! Commit verification for finished tasks.
//!
//! A task agent that settles is not trusted on its word: the verifier
//! counts commits between the group's base branch and the task branch.
//! An agent that idles at its prompt (`WaitingForInput`) after writing a
//! sentinel is a success candidate, but the commit check is the guard
//! against an agent that idles without having done anything.

use ensemble_state::session::RetryState;

use crate::broker::InstanceStatus;

/// Verification outcome for one settled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Verified work: at least one commit (or verification disabled).
    Success { commits: u32 },
    /// No commits, retries remain: requeue the task.
    NeedsRetry,
    /// Terminal failure.
    Failed { reason: String },
}

/// Grade a settled task.
///
/// | status                    | commits         | outcome      |
/// |---------------------------|-----------------|--------------|
/// | Error / Timeout / Stuck   | --              | failed       |
/// | Completed / WaitingForInput | >= 1          | success      |
/// | Completed / WaitingForInput | 0, retries left | needs-retry |
/// | Completed / WaitingForInput | 0, exhausted  | failed       |
///
/// `retry` is the state *before* this result is recorded; the caller
/// records the empty attempt when the outcome is `NeedsRetry` or a
/// no-commits failure. With `verify_commits` disabled, any
/// success-candidate status is credited without the commit check.
pub fn verify_task(
    status: InstanceStatus,
    commits: u32,
    retry: &RetryState,
    verify_commits: bool,
) -> VerifyOutcome {
    if !status.is_success_candidate() {
        return VerifyOutcome::Failed {
            reason: format!("agent finished with status {status}"),
        };
    }

    if !verify_commits {
        return VerifyOutcome::Success { commits };
    }

    if commits >= 1 {
        return VerifyOutcome::Success { commits };
    }

    if retry.retries_left() {
        VerifyOutcome::NeedsRetry
    } else {
        VerifyOutcome::Failed {
            reason: "produced no commits".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_with(empty_results: u32, cap: u32) -> RetryState {
        let mut r = RetryState::new(cap);
        for _ in 0..empty_results {
            r.record_empty("produced no commits");
        }
        r
    }

    #[test]
    fn terminal_agent_statuses_fail_without_commit_check() {
        for status in [
            InstanceStatus::Error,
            InstanceStatus::Timeout,
            InstanceStatus::Stuck,
        ] {
            let outcome = verify_task(status, 5, &RetryState::new(3), true);
            assert!(
                matches!(outcome, VerifyOutcome::Failed { .. }),
                "{status} should fail even with commits"
            );
        }
    }

    #[test]
    fn commits_make_success() {
        for status in [InstanceStatus::Completed, InstanceStatus::WaitingForInput] {
            assert_eq!(
                verify_task(status, 2, &RetryState::new(3), true),
                VerifyOutcome::Success { commits: 2 }
            );
        }
    }

    #[test]
    fn zero_commits_with_retries_left_requeues() {
        // Two empty results recorded, cap 3: one retry remains.
        let retry = retry_with(2, 3);
        assert_eq!(
            verify_task(InstanceStatus::Completed, 0, &retry, true),
            VerifyOutcome::NeedsRetry
        );
    }

    #[test]
    fn zero_commits_with_retries_exhausted_fails() {
        let retry = retry_with(3, 3);
        let outcome = verify_task(InstanceStatus::Completed, 0, &retry, true);
        assert_eq!(
            outcome,
            VerifyOutcome::Failed {
                reason: "produced no commits".to_string()
            }
        );
    }

    #[test]
    fn retry_cap_zero_fails_on_first_empty_result() {
        let retry = retry_with(0, 0);
        assert!(matches!(
            verify_task(InstanceStatus::Completed, 0, &retry, true),
            VerifyOutcome::Failed { .. }
        ));
    }

    #[test]
    fn verification_disabled_credits_without_commits() {
        assert_eq!(
            verify_task(InstanceStatus::WaitingForInput, 0, &RetryState::new(0), false),
            VerifyOutcome::Success { commits: 0 }
        );
        // But terminal agent failure still fails.
        assert!(matches!(
            verify_task(InstanceStatus::Timeout, 0, &RetryState::new(0), false),
            VerifyOutcome::Failed { .. }
        ));
    }
}
