//! Task scheduler: runs an ultra-plan's execution groups.
//!
//! One cooperative scheduler loop per session. Each tick drains
//! completion notices from the per-instance monitors, closes the current
//! group when every task has resolved, and dispatches the ready set up to
//! the parallelism cap. Monitors poll the broker once a second and fan
//! their notices into a bounded channel the scheduler drains.
//!
//! A group that closes with a mix of succeeded and failed tasks parks the
//! session behind a [`GroupDecision`]; the scheduler returns
//! [`SchedulerOutcome::AwaitingDecision`] and two external commands
//! ([`resume_with_partial`], [`retry_failed`]) resolve it before the
//! scheduler is re-run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ensemble_state::sentinels::{TaskCompletePayload, TaskSentinelStatus};
use ensemble_state::session::{GroupDecision, RetryState};

use crate::broker::{InstanceBroker, InstanceSpec, InstanceStatus};
use crate::consolidate::consolidate_group;
use crate::dispatcher::SessionHandle;
use crate::git::GitRepo;
use crate::layering::ready_set;
use crate::prompts;
use crate::sentinel::{self, SentinelKind};
use crate::verify::{VerifyOutcome, verify_task};

/// Capacity of the monitor fan-in channel.
const COMPLETION_CHANNEL_CAPACITY: usize = 100;

/// Scheduler timing knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between scheduler ticks when nothing was drained.
    pub tick_interval: Duration,
    /// Sleep between per-instance status observations.
    pub monitor_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Why the scheduler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// Every group executed and consolidated.
    Completed,
    /// A group closed with mixed results; an external decision is needed.
    AwaitingDecision,
    /// A whole group failed (no task produced verified work).
    Failed { failed_tasks: Vec<String> },
    /// Cancellation was requested; in-flight instances were stopped.
    Cancelled,
}

/// Notice sent from a monitor to the scheduler loop.
#[derive(Debug)]
struct CompletionNotice {
    task_id: String,
    instance: Uuid,
    status: InstanceStatus,
    /// The broker no longer knows the instance.
    vanished: bool,
}

/// The per-session task scheduler.
pub struct TaskScheduler {
    handle: SessionHandle,
    broker: Arc<dyn InstanceBroker>,
    git: Arc<GitRepo>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(
        handle: SessionHandle,
        broker: Arc<dyn InstanceBroker>,
        git: Arc<GitRepo>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            handle,
            broker,
            git,
            config,
        }
    }

    /// Base branch the current group's tasks are rooted on: the
    /// repository base for group 0, otherwise the previous group's
    /// consolidated branch (from the explicit record).
    fn group_base(&self) -> String {
        self.handle.with_read(|s| {
            let ultra = s.ultra().expect("scheduler requires an ultra-plan session");
            if ultra.current_group == 0 {
                s.config.base_branch.clone()
            } else {
                ultra.group_branches[ultra.current_group - 1].clone()
            }
        })
    }

    /// Run the scheduling loop until the plan finishes, a decision is
    /// needed, a group fails outright, or cancellation is requested.
    pub async fn run(&self) -> Result<SchedulerOutcome> {
        let cancel = self.handle.cancel_token();
        let (tx, mut rx) = mpsc::channel::<CompletionNotice>(COMPLETION_CHANNEL_CAPACITY);
        let mut monitors: Vec<JoinHandle<()>> = Vec::new();

        loop {
            // Cancellation: stop instances, join monitors, report back.
            if cancel.is_cancelled() {
                self.stop_all_running().await;
                for monitor in monitors.drain(..) {
                    let _ = monitor.await;
                }
                return Ok(SchedulerOutcome::Cancelled);
            }

            // Drain completion notices without blocking.
            let mut drained = false;
            while let Ok(notice) = rx.try_recv() {
                drained = true;
                self.handle_completion(notice).await?;
            }
            monitors.retain(|m| !m.is_finished());

            // Every group already consolidated (e.g. after an external
            // resume-with-partial advanced past the last group).
            let plan_done = self.handle.with_read(|s| {
                let ultra = s.ultra().expect("ultra-plan session");
                ultra
                    .plan
                    .as_ref()
                    .is_some_and(|p| ultra.current_group >= p.execution_order.len())
            });
            if plan_done {
                return Ok(SchedulerOutcome::Completed);
            }

            // Close the current group when every task in it has resolved.
            if let Some(outcome) = self.close_group_if_resolved().await? {
                match outcome {
                    GroupCloseOutcome::PlanComplete => return Ok(SchedulerOutcome::Completed),
                    GroupCloseOutcome::Advanced => continue,
                    GroupCloseOutcome::AllFailed(failed_tasks) => {
                        return Ok(SchedulerOutcome::Failed { failed_tasks });
                    }
                    GroupCloseOutcome::NeedsDecision => {
                        if self.handle.with_read(|s| {
                            s.ultra().map(|u| u.running.is_empty()).unwrap_or(true)
                        }) {
                            return Ok(SchedulerOutcome::AwaitingDecision);
                        }
                    }
                }
            }

            // Dispatch the ready set up to the parallelism cap.
            self.dispatch_ready(&tx, &mut monitors, &cancel).await?;

            if !drained {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.tick_interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Dispatch every ready task while the running count is below the cap.
    async fn dispatch_ready(
        &self,
        tx: &mpsc::Sender<CompletionNotice>,
        monitors: &mut Vec<JoinHandle<()>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (ready, short_id, cap, running) = self.handle.with_read(|s| {
            let ultra = s.ultra().expect("ultra-plan session");
            (
                ready_set(ultra),
                s.short_id(),
                s.config.max_parallel,
                ultra.running.len(),
            )
        });

        if ready.is_empty() || running >= cap {
            return Ok(());
        }

        let base = self.group_base();
        let mut slots = cap - running;

        for task_id in ready {
            if slots == 0 {
                break;
            }

            let prompt = self.handle.with_read(|s| {
                let ultra = s.ultra().expect("ultra-plan session");
                let plan = ultra.plan.as_ref().expect("accepted plan");
                let task = plan.task(&task_id).expect("task in plan");
                prompts::task_prompt(plan, task, ultra.retries.get(&task_id))
            });

            let spec = InstanceSpec::new(short_id.clone(), task_id.clone(), prompt);
            let instance = match self.start_instance(spec, &base).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(task = %task_id, error = %e, "failed to start task agent");
                    self.record_task_failure(&task_id, &format!("failed to start agent: {e:#}"))
                        .await;
                    continue;
                }
            };

            slots -= 1;
            self.handle
                .mutate_and_persist(|s| {
                    let cap = s.config.retry_cap;
                    let ultra = s.ultra_mut().expect("ultra-plan session");
                    ultra.running.insert(task_id.clone(), instance);
                    ultra
                        .retries
                        .entry(task_id.clone())
                        .or_insert_with(|| RetryState::new(cap));
                })
                .await;

            tracing::info!(task = %task_id, instance = %instance, "task dispatched");
            self.handle
                .observer()
                .on_task_started(self.handle.id(), &task_id, instance);

            monitors.push(spawn_monitor(
                task_id,
                instance,
                Arc::clone(&self.broker),
                tx.clone(),
                cancel.clone(),
                self.config.monitor_interval,
            ));
        }

        Ok(())
    }

    async fn start_instance(&self, spec: InstanceSpec, base: &str) -> Result<Uuid> {
        let handle = self
            .broker
            .create_from_branch(spec, base)
            .await
            .context("broker could not create instance")?;
        self.broker
            .start(handle.id)
            .await
            .context("broker could not start instance")?;
        Ok(handle.id)
    }

    /// Process one settled instance: verify, then complete, requeue, or
    /// fail the task.
    async fn handle_completion(&self, notice: CompletionNotice) -> Result<()> {
        let task_id = notice.task_id.clone();

        if notice.vanished {
            self.record_task_failure(&task_id, "instance not found").await;
            return Ok(());
        }

        if !notice.status.is_success_candidate() {
            self.record_task_failure(
                &task_id,
                &format!("agent finished with status {}", notice.status),
            )
            .await;
            return Ok(());
        }

        // Idle single-shot agents are stopped before verification.
        if let Err(e) = self.broker.stop(notice.instance).await {
            tracing::warn!(instance = %notice.instance, error = %e, "failed to stop settled instance");
        }

        // Consult the task sentinel when present. A missing sentinel is
        // tolerated -- the commit check below is the guard against idle
        // agents that did nothing.
        if let Some(handle) = self.broker.get(notice.instance).await {
            match sentinel::consume::<TaskCompletePayload>(
                &handle.worktree,
                SentinelKind::TaskComplete,
            ) {
                Ok(Some(payload)) if payload.status != TaskSentinelStatus::Complete => {
                    self.record_task_failure(
                        &task_id,
                        &format!("task reported status {:?}: {}", payload.status, payload.summary),
                    )
                    .await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    self.record_task_failure(&task_id, &format!("malformed sentinel: {e}"))
                        .await;
                    return Ok(());
                }
            }
        }

        let base = self.group_base();
        let (short_id, prefix, verify_commits) = self.handle.with_read(|s| {
            (
                s.short_id(),
                s.config.branch_prefix.clone(),
                s.config.verify_commits,
            )
        });
        let branch = GitRepo::branch_name(&prefix, &short_id, &task_id);
        let commits = self
            .git
            .count_commits_between(&base, &branch)
            .with_context(|| format!("failed to count commits for task {task_id}"))?;

        let retry_snapshot = self.handle.with_read(|s| {
            s.ultra()
                .and_then(|u| u.retries.get(&task_id).cloned())
                .unwrap_or_else(|| RetryState::new(s.config.retry_cap))
        });

        match verify_task(notice.status, commits, &retry_snapshot, verify_commits) {
            VerifyOutcome::Success { commits } => {
                self.handle
                    .mutate_and_persist(|s| {
                        let ultra = s.ultra_mut().expect("ultra-plan session");
                        ultra.running.remove(&task_id);
                        ultra.completed.insert(task_id.clone());
                        ultra.task_commit_counts.insert(task_id.clone(), commits);
                        if let Some(retry) = ultra.retries.get_mut(&task_id) {
                            retry.record_success(commits);
                        }
                    })
                    .await;
                tracing::info!(task = %task_id, commits, "task completed");
                self.handle
                    .observer()
                    .on_task_completed(self.handle.id(), &task_id, commits);
            }
            VerifyOutcome::NeedsRetry => {
                self.handle
                    .mutate_and_persist(|s| {
                        let ultra = s.ultra_mut().expect("ultra-plan session");
                        ultra.running.remove(&task_id);
                        if let Some(retry) = ultra.retries.get_mut(&task_id) {
                            retry.record_empty("produced no commits");
                        }
                    })
                    .await;
                tracing::info!(task = %task_id, "task produced no commits, requeued");
            }
            VerifyOutcome::Failed { reason } => {
                if commits == 0 {
                    self.handle
                        .mutate(|s| {
                            if let Some(retry) = s
                                .ultra_mut()
                                .and_then(|u| u.retries.get_mut(&task_id))
                            {
                                retry.record_empty(reason.clone());
                            }
                        });
                }
                self.record_task_failure(&task_id, &reason).await;
            }
        }

        Ok(())
    }

    async fn record_task_failure(&self, task_id: &str, reason: &str) {
        self.handle
            .mutate_and_persist(|s| {
                let ultra = s.ultra_mut().expect("ultra-plan session");
                ultra.running.remove(task_id);
                ultra.failed.insert(task_id.to_string());
                if let Some(retry) = ultra.retries.get_mut(task_id) {
                    retry.last_error = Some(reason.to_string());
                }
            })
            .await;
        tracing::warn!(task = %task_id, reason, "task failed");
        self.handle
            .observer()
            .on_task_failed(self.handle.id(), task_id, reason);
    }

    /// If every task of the current group has resolved, close it:
    /// consolidate and advance, fail, or raise a group decision.
    async fn close_group_if_resolved(&self) -> Result<Option<GroupCloseOutcome>> {
        let snapshot = self.handle.with_read(|s| {
            let ultra = s.ultra().expect("ultra-plan session");
            let plan = ultra.plan.as_ref()?;
            let group = plan.execution_order.get(ultra.current_group)?;

            let unresolved: Vec<&String> = group
                .iter()
                .filter(|t| !ultra.completed.contains(*t) && !ultra.failed.contains(*t))
                .collect();
            if !unresolved.is_empty() {
                return None;
            }

            let succeeded: Vec<String> = group
                .iter()
                .filter(|t| ultra.completed.contains(*t))
                .cloned()
                .collect();
            let failed: Vec<String> = group
                .iter()
                .filter(|t| ultra.failed.contains(*t))
                .cloned()
                .collect();
            Some((ultra.current_group, succeeded, failed, ultra.group_decision.clone()))
        });

        let Some((group_index, succeeded, failed, existing_decision)) = snapshot else {
            return Ok(None);
        };

        if failed.is_empty() {
            // Clean group: consolidate and advance.
            self.consolidate_and_advance(group_index, &succeeded).await?;
            let done = self.handle.with_read(|s| {
                let ultra = s.ultra().expect("ultra-plan session");
                let groups = ultra
                    .plan
                    .as_ref()
                    .map(|p| p.execution_order.len())
                    .unwrap_or(0);
                ultra.current_group >= groups
            });
            return Ok(Some(if done {
                GroupCloseOutcome::PlanComplete
            } else {
                GroupCloseOutcome::Advanced
            }));
        }

        if succeeded.is_empty() {
            return Ok(Some(GroupCloseOutcome::AllFailed(failed)));
        }

        // Mixed results: park behind a decision record (once).
        if existing_decision.is_none() {
            let decision = GroupDecision {
                group_index,
                succeeded,
                failed,
                awaiting_decision: true,
                created_at: Utc::now(),
            };
            self.handle
                .mutate_and_persist(|s| {
                    s.ultra_mut().expect("ultra-plan session").group_decision =
                        Some(decision.clone());
                })
                .await;
            tracing::warn!(
                group = group_index,
                "group closed with mixed results, awaiting decision"
            );
            self.handle
                .observer()
                .on_group_decision(self.handle.id(), &decision);
        }
        Ok(Some(GroupCloseOutcome::NeedsDecision))
    }

    /// Consolidate `tasks` for `group_index` and advance the cursor.
    async fn consolidate_and_advance(&self, group_index: usize, tasks: &[String]) -> Result<()> {
        let base = self.group_base();
        let (short_id, prefix, push) = self.handle.with_read(|s| {
            (
                s.short_id(),
                s.config.branch_prefix.clone(),
                s.config.push_branches,
            )
        });

        let pairs: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.clone(), GitRepo::branch_name(&prefix, &short_id, t)))
            .collect();

        let consolidation =
            consolidate_group(&self.git, &prefix, &short_id, &base, group_index, &pairs, push)
                .with_context(|| format!("consolidation of group {group_index} failed"))?;

        self.handle
            .mutate_and_persist(|s| {
                let ultra = s.ultra_mut().expect("ultra-plan session");
                ultra.group_branches.push(consolidation.branch.clone());
                ultra.current_group += 1;
                ultra.group_decision = None;
            })
            .await;

        tracing::info!(
            group = group_index,
            branch = %consolidation.branch,
            commits = consolidation.commits,
            "group consolidated"
        );
        self.handle.observer().on_group_consolidated(
            self.handle.id(),
            group_index,
            &consolidation.branch,
        );
        Ok(())
    }

    /// Issue stop-instance to every running agent.
    async fn stop_all_running(&self) {
        let running: Vec<Uuid> = self.handle.with_read(|s| {
            s.ultra()
                .map(|u| u.running.values().copied().collect())
                .unwrap_or_default()
        });
        for instance in running {
            if let Err(e) = self.broker.stop(instance).await {
                tracing::warn!(instance = %instance, error = %e, "failed to stop instance on cancel");
            }
        }
    }
}

/// Outcome of a group-closure check.
enum GroupCloseOutcome {
    /// Group consolidated and the cursor advanced; more groups remain.
    Advanced,
    /// The last group consolidated; the plan is done.
    PlanComplete,
    /// Every task in the group failed.
    AllFailed(Vec<String>),
    /// Mixed results; a decision record is pending.
    NeedsDecision,
}

/// Spawn the monitor for one running instance.
fn spawn_monitor(
    task_id: String,
    instance: Uuid,
    broker: Arc<dyn InstanceBroker>,
    tx: mpsc::Sender<CompletionNotice>,
    cancel: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }

            match broker.status(instance).await {
                Ok(status) if status.is_settled() => {
                    let _ = tx
                        .send(CompletionNotice {
                            task_id,
                            instance,
                            status,
                            vanished: false,
                        })
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(instance = %instance, error = %e, "instance vanished");
                    let _ = tx
                        .send(CompletionNotice {
                            task_id,
                            instance,
                            status: InstanceStatus::Error,
                            vanished: true,
                        })
                        .await;
                    return;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// External decision commands
// ---------------------------------------------------------------------------

/// Resolve a pending group decision by consolidating only the succeeded
/// tasks and advancing the group cursor. Failed tasks stay failed.
pub async fn resume_with_partial(
    handle: &SessionHandle,
    git: &GitRepo,
) -> Result<()> {
    let decision = handle
        .with_read(|s| s.ultra().and_then(|u| u.group_decision.clone()))
        .context("no group decision pending")?;

    let base = handle.with_read(|s| {
        let ultra = s.ultra().expect("ultra-plan session");
        if ultra.current_group == 0 {
            s.config.base_branch.clone()
        } else {
            ultra.group_branches[ultra.current_group - 1].clone()
        }
    });
    let (short_id, prefix, push) = handle.with_read(|s| {
        (
            s.short_id(),
            s.config.branch_prefix.clone(),
            s.config.push_branches,
        )
    });

    let pairs: Vec<(String, String)> = decision
        .succeeded
        .iter()
        .map(|t| (t.clone(), GitRepo::branch_name(&prefix, &short_id, t)))
        .collect();

    let consolidation = consolidate_group(
        git,
        &prefix,
        &short_id,
        &base,
        decision.group_index,
        &pairs,
        push,
    )?;

    handle
        .mutate_and_persist(|s| {
            let ultra = s.ultra_mut().expect("ultra-plan session");
            ultra.group_branches.push(consolidation.branch.clone());
            ultra.current_group += 1;
            ultra.group_decision = None;
        })
        .await;

    tracing::info!(
        group = decision.group_index,
        branch = %consolidation.branch,
        skipped = decision.failed.len(),
        "resumed with partial group"
    );
    handle
        .observer()
        .on_group_consolidated(handle.id(), decision.group_index, &consolidation.branch);
    Ok(())
}

/// Resolve a pending group decision by retrying the failed subset within
/// the same group: reset their retry counts, remove them from the failed
/// set and the task-instance mapping, and clear the decision.
pub async fn retry_failed(handle: &SessionHandle) -> Result<()> {
    let decision = handle
        .with_read(|s| s.ultra().and_then(|u| u.group_decision.clone()))
        .context("no group decision pending")?;

    handle
        .mutate_and_persist(|s| {
            let retry_cap = s.config.retry_cap;
            let ultra = s.ultra_mut().expect("ultra-plan session");
            for task_id in &decision.failed {
                ultra.failed.remove(task_id);
                ultra.completed.remove(task_id);
                ultra.running.remove(task_id);
                ultra
                    .retries
                    .insert(task_id.clone(), RetryState::new(retry_cap));
            }
            ultra.group_decision = None;
        })
        .await;

    tracing::info!(
        group = decision.group_index,
        tasks = decision.failed.len(),
        "retrying failed tasks within group"
    );
    Ok(())
}
