//! Triple-shot driver: three parallel attempts, then a judge.
//!
//! Each attempt runs in its own worktree and branch and terminates by
//! writing its attempt sentinel. Once all three resolve, a judge agent
//! is spawned in a fresh worktree with the attempts' summaries embedded
//! in its prompt; its evaluation sentinel selects a winner or directs a
//! merge, and the winning branch is recorded for consolidation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use ensemble_state::phase::Phase;
use ensemble_state::sentinels::{
    AttemptPayload, AttemptSentinelStatus, EvaluationPayload, MergeStrategy,
};
use ensemble_state::session::AttemptStatus;

use crate::broker::{InstanceBroker, InstanceSpec};
use crate::dispatcher::SessionHandle;
use crate::prompts;
use crate::sentinel::{self, SentinelKind};

/// Driver for triple-shot sessions.
pub struct TripleShotDriver {
    handle: SessionHandle,
    broker: Arc<dyn InstanceBroker>,
    poll_interval: Duration,
}

impl TripleShotDriver {
    pub fn new(handle: SessionHandle, broker: Arc<dyn InstanceBroker>) -> Self {
        Self {
            handle,
            broker,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run attempts and judge to a terminal phase.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.handle.cancel_token();
        let (task, short_id, base) = self.handle.with_read(|s| {
            let ts = s.tripleshot().expect("triple-shot session");
            (ts.task.clone(), s.short_id(), s.config.base_branch.clone())
        });

        // Launch all three attempts in parallel worktrees.
        let mut attempt_instances = Vec::new();
        for index in 0..3u32 {
            let spec = InstanceSpec::new(
                short_id.clone(),
                format!("attempt-{index}"),
                prompts::attempt_prompt(&task, index),
            );
            let instance = self.broker.create_from_branch(spec, &base).await?;
            self.broker.start(instance.id).await?;

            self.handle
                .mutate_and_persist(|s| {
                    let ts = s.tripleshot_mut().expect("triple-shot session");
                    let attempt = &mut ts.attempts[index as usize];
                    attempt.worktree = Some(instance.worktree.clone());
                    attempt.branch = Some(instance.branch.clone());
                    attempt.instance = Some(instance.id);
                    attempt.status = AttemptStatus::Running;
                    attempt.started_at = Some(Utc::now());
                })
                .await;
            attempt_instances.push(instance);
        }

        // Wait for each attempt's sentinel (they finish in any order; we
        // poll all three each pass).
        let mut resolved = [false; 3];
        while resolved.iter().any(|done| !done) {
            if cancel.is_cancelled() {
                for instance in &attempt_instances {
                    let _ = self.broker.stop(instance.id).await;
                }
                self.handle.mark_cancelled().await;
                return Ok(());
            }

            for (index, instance) in attempt_instances.iter().enumerate() {
                if resolved[index] {
                    continue;
                }

                match sentinel::consume::<AttemptPayload>(
                    &instance.worktree,
                    SentinelKind::TripleShotComplete,
                ) {
                    Ok(Some(payload)) => {
                        resolved[index] = true;
                        let _ = self.broker.stop(instance.id).await;
                        let status = match payload.status {
                            AttemptSentinelStatus::Complete => AttemptStatus::Complete,
                            AttemptSentinelStatus::Failed => AttemptStatus::Failed,
                        };
                        self.handle
                            .mutate_and_persist(|s| {
                                let ts = s.tripleshot_mut().expect("triple-shot session");
                                let attempt = &mut ts.attempts[index];
                                attempt.status = status;
                                attempt.completed_at = Some(Utc::now());
                                attempt.summary = Some(payload.summary.clone());
                            })
                            .await;
                        tracing::info!(attempt = index, status = ?status, "attempt resolved");
                    }
                    Ok(None) => {
                        // Not done yet -- unless the agent already died.
                        let settled_badly = match self.broker.status(instance.id).await {
                            Ok(status) => {
                                status.is_settled() && !status.is_success_candidate()
                            }
                            Err(_) => true,
                        };
                        if settled_badly {
                            resolved[index] = true;
                            let _ = self.broker.stop(instance.id).await;
                            self.handle
                                .mutate_and_persist(|s| {
                                    let ts =
                                        s.tripleshot_mut().expect("triple-shot session");
                                    let attempt = &mut ts.attempts[index];
                                    attempt.status = AttemptStatus::Failed;
                                    attempt.completed_at = Some(Utc::now());
                                })
                                .await;
                            tracing::warn!(attempt = index, "attempt agent failed without sentinel");
                        }
                    }
                    Err(e) => {
                        resolved[index] = true;
                        let _ = self.broker.stop(instance.id).await;
                        self.handle
                            .mutate_and_persist(|s| {
                                let ts = s.tripleshot_mut().expect("triple-shot session");
                                let attempt = &mut ts.attempts[index];
                                attempt.status = AttemptStatus::Failed;
                                attempt.completed_at = Some(Utc::now());
                                attempt.summary = Some(format!("malformed sentinel: {e}"));
                            })
                            .await;
                        tracing::warn!(attempt = index, error = %e, "malformed attempt sentinel");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }

        // All attempts resolved: spawn the judge.
        self.handle.transition(Phase::Evaluating).await?;

        let summaries: Vec<(u32, String, String)> = self.handle.with_read(|s| {
            let ts = s.tripleshot().expect("triple-shot session");
            ts.attempts
                .iter()
                .map(|a| {
                    (
                        a.index,
                        a.branch.clone().unwrap_or_default(),
                        match a.status {
                            AttemptStatus::Complete => a
                                .summary
                                .clone()
                                .unwrap_or_else(|| "no summary".to_string()),
                            _ => format!(
                                "FAILED: {}",
                                a.summary.clone().unwrap_or_else(|| "no details".to_string())
                            ),
                        },
                    )
                })
                .collect()
        });

        let judge = self
            .broker
            .create_from_branch(
                InstanceSpec::new(
                    short_id,
                    "judge",
                    prompts::judge_prompt(&task, &summaries),
                ),
                &base,
            )
            .await?;
        self.broker.start(judge.id).await?;

        let evaluation = match sentinel::await_sentinel::<EvaluationPayload>(
            &judge.worktree,
            SentinelKind::TripleShotEvaluation,
            self.poll_interval,
            &cancel,
        )
        .await
        {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let _ = self.broker.stop(judge.id).await;
                self.handle.mark_cancelled().await;
                return Ok(());
            }
            Err(e) => {
                let _ = self.broker.stop(judge.id).await;
                self.handle.fail(format!("evaluation sentinel: {e}")).await;
                return Ok(());
            }
        };
        let _ = self.broker.stop(judge.id).await;

        // Record the verdict and the winning branch for consolidation.
        let winning_branch = if (0..3).contains(&evaluation.winner_index) {
            self.handle.with_read(|s| {
                s.tripleshot()
                    .and_then(|ts| ts.attempts.get(evaluation.winner_index as usize))
                    .and_then(|a| a.branch.clone())
            })
        } else {
            None
        };

        let strategy = evaluation.merge_strategy;
        self.handle
            .mutate_and_persist(|s| {
                let ts = s.tripleshot_mut().expect("triple-shot session");
                ts.evaluation = Some(evaluation.clone());
                ts.winning_branch = winning_branch.clone();
            })
            .await;

        if winning_branch.is_none() && strategy == MergeStrategy::Select {
            self.handle
                .fail("judge selected no usable attempt")
                .await;
            return Ok(());
        }

        self.handle.transition(Phase::Complete).await?;
        let summary = match &winning_branch {
            Some(branch) => format!("winning branch {branch} ({strategy:?})"),
            None => format!("merge directive recorded ({strategy:?})"),
        };
        tracing::info!(%summary, "triple-shot session complete");
        self.handle
            .observer()
            .on_finished(self.handle.id(), true, &summary);
        Ok(())
    }
}
