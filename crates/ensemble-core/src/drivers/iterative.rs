//! Iterative-loop driver: one long-lived agent re-prompted until it
//! keeps its promise.
//!
//! The agent is started once and re-prompted between iterations through
//! the broker's send-input operation -- the only mode that uses it. Two
//! signals end the loop: the completion phrase appearing between
//! `<promise>` tags in output appended during the current iteration, or
//! the iteration cap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use ensemble_state::phase::Phase;
use ensemble_state::sentinels::RalphStatusPayload;
use ensemble_state::session::IterationRecord;

use crate::broker::{InstanceBroker, InstanceSpec, InstanceStatus};
use crate::dispatcher::SessionHandle;
use crate::git::GitRepo;
use crate::prompts;
use crate::sentinel::{self, SentinelKind};

/// Check whether `output` contains `<promise>PHRASE</promise>`.
///
/// Tags are matched case-insensitively; the inner text is trimmed and
/// compared to the phrase ignoring ASCII case, so
/// `<promise> done </promise>` matches the phrase `DONE`.
pub fn contains_promise(output: &str, phrase: &str) -> bool {
    const OPEN: &str = "<promise>";
    const CLOSE: &str = "</promise>";

    let lower = output.to_ascii_lowercase();
    let phrase = phrase.trim();
    let mut from = 0;

    while let Some(start) = lower[from..].find(OPEN) {
        let inner_start = from + start + OPEN.len();
        let Some(end) = lower[inner_start..].find(CLOSE) else {
            return false;
        };
        let inner = &output[inner_start..inner_start + end];
        if inner.trim().eq_ignore_ascii_case(phrase) {
            return true;
        }
        from = inner_start + end + CLOSE.len();
    }
    false
}

/// Driver for iterative-loop sessions.
pub struct IterativeDriver {
    handle: SessionHandle,
    broker: Arc<dyn InstanceBroker>,
    git: Arc<GitRepo>,
    poll_interval: Duration,
}

impl IterativeDriver {
    pub fn new(
        handle: SessionHandle,
        broker: Arc<dyn InstanceBroker>,
        git: Arc<GitRepo>,
    ) -> Self {
        Self {
            handle,
            broker,
            git,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the loop to a terminal phase.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.handle.cancel_token();
        let (prompt, phrase, cap, short_id, base) = self.handle.with_read(|s| {
            let iter = s.iterative().expect("iterative session");
            (
                iter.prompt.clone(),
                iter.completion_phrase.clone(),
                iter.iteration_cap,
                s.short_id(),
                s.config.base_branch.clone(),
            )
        });

        // Start (or re-adopt) the long-lived instance.
        let existing = self.handle.with_read(|s| s.iterative().and_then(|i| i.instance));
        let adopted = match existing {
            Some(id) => self.broker.get(id).await,
            None => None,
        };
        let instance = match adopted {
            Some(handle) => handle,
            None => {
                let handle = self
                    .broker
                    .create_from_branch(
                        InstanceSpec::new(
                            short_id,
                            "loop",
                            prompts::iterative_prompt(&prompt, &phrase),
                        ),
                        &base,
                    )
                    .await
                    .context("failed to create loop instance")?;
                self.broker.start(handle.id).await?;
                self.handle
                    .mutate_and_persist(|s| {
                        let iter = s.iterative_mut().expect("iterative session");
                        iter.instance = Some(handle.id);
                        iter.worktree = Some(handle.worktree.clone());
                    })
                    .await;
                handle
            }
        };

        let mut prev_commits = self
            .git
            .count_commits_between(&base, &instance.branch)
            .unwrap_or(0);

        loop {
            if cancel.is_cancelled() {
                let _ = self.broker.stop(instance.id).await;
                self.handle.mark_cancelled().await;
                return Ok(());
            }

            // Paused sessions idle at the iteration boundary.
            if self.handle.phase() == Phase::Paused {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                    _ = cancel.cancelled() => continue,
                }
            }

            let iteration = self
                .handle
                .with_read(|s| s.iterative().map(|i| i.iterations.len() as u32).unwrap_or(0))
                + 1;

            self.handle
                .mutate_and_persist(|s| {
                    s.iterative_mut()
                        .expect("iterative session")
                        .iterations
                        .push(IterationRecord {
                            index: iteration,
                            started_at: Utc::now(),
                            completed_at: None,
                            had_commits: false,
                        });
                })
                .await;
            tracing::info!(iteration, "iteration started");

            // Only output appended during this iteration is scanned.
            let iteration_start = self.broker.output(instance.id).await?.len();

            let ended = loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = cancel.cancelled() => break IterationEnd::Cancelled,
                }

                let output = self.broker.output(instance.id).await?;
                let appended = String::from_utf8_lossy(&output[iteration_start.min(output.len())..]);
                if contains_promise(&appended, &phrase) {
                    break IterationEnd::PromiseFound;
                }

                match self.broker.status(instance.id).await {
                    Ok(InstanceStatus::Working) | Ok(InstanceStatus::Pending) => {}
                    Ok(InstanceStatus::WaitingForInput) => break IterationEnd::Idle,
                    Ok(status) => break IterationEnd::AgentGone(status),
                    Err(_) => break IterationEnd::AgentGone(InstanceStatus::Error),
                }
            };

            match ended {
                IterationEnd::Cancelled => continue,
                IterationEnd::PromiseFound => {
                    self.finish_iteration(iteration, &instance.branch, &base, &mut prev_commits)
                        .await;
                    let _ = self.broker.stop(instance.id).await;
                    self.handle.transition(Phase::Complete).await?;
                    tracing::info!(iteration, phrase = %phrase, "completion phrase observed");
                    self.handle.observer().on_finished(
                        self.handle.id(),
                        true,
                        &format!("promise kept in iteration {iteration}"),
                    );
                    return Ok(());
                }
                IterationEnd::AgentGone(status) => {
                    let _ = self.broker.stop(instance.id).await;
                    self.handle
                        .fail(format!(
                            "loop agent left the working state ({status}) before the \
                             completion phrase"
                        ))
                        .await;
                    return Ok(());
                }
                IterationEnd::Idle => {
                    self.finish_iteration(iteration, &instance.branch, &base, &mut prev_commits)
                        .await;

                    if iteration >= cap {
                        let _ = self.broker.stop(instance.id).await;
                        self.handle.transition(Phase::MaxIterations).await?;
                        tracing::warn!(cap, "iteration cap reached without promise");
                        self.handle.observer().on_finished(
                            self.handle.id(),
                            false,
                            &format!("iteration cap {cap} reached"),
                        );
                        return Ok(());
                    }

                    // Re-prompt; the agent's status returns to working as
                    // soon as it produces output again.
                    let continue_prompt =
                        prompts::iterative_continue_prompt(iteration + 1, &phrase);
                    self.broker
                        .send_input(instance.id, continue_prompt.as_bytes())
                        .await
                        .context("failed to re-prompt loop agent")?;
                }
            }
        }
    }

    /// Close out an iteration record: timestamps, commit delta, and the
    /// agent's own status sentinel (consumed for bookkeeping only).
    async fn finish_iteration(
        &self,
        iteration: u32,
        branch: &str,
        base: &str,
        prev_commits: &mut u32,
    ) {
        let commits = self.git.count_commits_between(base, branch).unwrap_or(*prev_commits);
        let had_commits = commits > *prev_commits;
        *prev_commits = commits;

        let worktree = self.handle.with_read(|s| {
            s.iterative().and_then(|i| i.worktree.clone())
        });
        if let Some(worktree) = worktree {
            match sentinel::consume::<RalphStatusPayload>(&worktree, SentinelKind::RalphStatus) {
                Ok(Some(status)) => {
                    tracing::debug!(
                        iteration,
                        agent_phase = %status.phase,
                        last_activity = %status.last_activity,
                        "loop status sentinel"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(iteration, error = %e, "unreadable loop status sentinel");
                }
            }
        }

        self.handle
            .mutate_and_persist(|s| {
                let iter = s.iterative_mut().expect("iterative session");
                if let Some(record) = iter.iterations.iter_mut().find(|r| r.index == iteration) {
                    record.completed_at = Some(Utc::now());
                    record.had_commits = had_commits;
                }
            })
            .await;
    }
}

enum IterationEnd {
    PromiseFound,
    Idle,
    AgentGone(InstanceStatus),
    Cancelled,
}

/// Pause a running loop at the next iteration boundary.
pub async fn pause(handle: &SessionHandle) -> Result<()> {
    handle.transition(Phase::Paused).await
}

/// Resume a paused loop.
pub async fn resume(handle: &SessionHandle) -> Result<()> {
    handle.transition(Phase::Working).await
}
