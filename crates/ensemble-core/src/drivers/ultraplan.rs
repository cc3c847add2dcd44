//! Ultra-plan driver: planning, execution, synthesis, consolidation.
//!
//! Drives a session through
//! `Planning -> PlanSelection? -> Refresh -> Executing -> Synthesis ->
//! (Revision -> Synthesis)* -> Consolidating -> Complete`.
//!
//! The driver is phase-resumable: `run` dispatches on the session's
//! current phase, so a restored session continues where it stopped, and
//! a session parked in `PlanSelection` or behind a group decision picks
//! up after the external command lands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use ensemble_state::phase::Phase;
use ensemble_state::plan::Plan;
use ensemble_state::sentinels::{
    ConsolidationPayload, ConsolidationStatus, PlanPayload, RevisionPayload, SynthesisPayload,
};

use crate::broker::{InstanceBroker, InstanceSpec};
use crate::dispatcher::SessionHandle;
use crate::git::GitRepo;
use crate::layering::accept_plan;
use crate::prompts;
use crate::scheduler::{SchedulerConfig, SchedulerOutcome, TaskScheduler};
use crate::sentinel::{self, SentinelKind};

/// Outcome of one `run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The session reached a terminal phase.
    Finished,
    /// Parked in `PlanSelection`: an external `select_plan` is required.
    AwaitingPlanSelection,
    /// Parked behind a group decision: resolve it and re-run.
    AwaitingGroupDecision,
}

/// Driver for ultra-plan sessions.
pub struct UltraPlanDriver {
    handle: SessionHandle,
    broker: Arc<dyn InstanceBroker>,
    git: Arc<GitRepo>,
    scheduler_config: SchedulerConfig,
    /// Sentinel poll interval for single-agent phases.
    poll_interval: Duration,
}

impl UltraPlanDriver {
    pub fn new(
        handle: SessionHandle,
        broker: Arc<dyn InstanceBroker>,
        git: Arc<GitRepo>,
    ) -> Self {
        Self {
            handle,
            broker,
            git,
            scheduler_config: SchedulerConfig::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the session from its current phase until it finishes or parks.
    pub async fn run(&self) -> Result<RunOutcome> {
        loop {
            if self.handle.is_cancel_requested() && !self.handle.phase().is_terminal() {
                self.handle.mark_cancelled().await;
                return Ok(RunOutcome::Finished);
            }

            match self.handle.phase() {
                Phase::Planning => self.run_planning().await?,
                Phase::PlanSelection => return Ok(RunOutcome::AwaitingPlanSelection),
                Phase::Refresh => self.run_refresh().await?,
                Phase::Executing => {
                    if self.run_executing().await? {
                        return Ok(RunOutcome::AwaitingGroupDecision);
                    }
                }
                Phase::Synthesis => self.run_synthesis_cycle().await?,
                Phase::Revision => {
                    // A restart mid-revision re-enters through synthesis,
                    // which re-derives what still needs fixing.
                    self.handle.transition(Phase::Synthesis).await?;
                }
                Phase::Consolidating => self.run_consolidating().await?,
                phase if phase.is_terminal() => return Ok(RunOutcome::Finished),
                phase => bail!("ultra-plan driver cannot resume from phase {phase}"),
            }
        }
    }

    // -- Planning ---------------------------------------------------------

    async fn run_planning(&self) -> Result<()> {
        let (objective, candidates, base) = self.handle.with_read(|s| {
            (
                s.objective.clone(),
                s.config.plan_candidates.max(1),
                s.config.base_branch.clone(),
            )
        });
        let short_id = self.handle.with_read(|s| s.short_id());
        let cancel = self.handle.cancel_token();

        let mut plans: Vec<Plan> = Vec::new();
        for index in 0..candidates {
            let role = if candidates == 1 {
                "planner".to_string()
            } else {
                format!("planner-{index}")
            };
            let spec = InstanceSpec::new(
                short_id.clone(),
                role,
                prompts::planner_prompt(&objective),
            );
            let instance = self
                .broker
                .create_from_branch(spec, &base)
                .await
                .context("failed to create planner instance")?;
            self.broker.start(instance.id).await?;

            let payload = match sentinel::await_sentinel::<PlanPayload>(
                &instance.worktree,
                SentinelKind::Plan,
                self.poll_interval,
                &cancel,
            )
            .await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    // Cancelled while waiting.
                    let _ = self.broker.stop(instance.id).await;
                    self.handle.mark_cancelled().await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.broker.stop(instance.id).await;
                    self.handle.fail(format!("plan sentinel: {e}")).await;
                    return Ok(());
                }
            };
            let _ = self.broker.stop(instance.id).await;

            match accept_plan(payload) {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    self.handle.fail(format!("plan rejected: {e}")).await;
                    return Ok(());
                }
            }
        }

        if plans.len() == 1 {
            let plan = plans.pop().unwrap_or_else(|| unreachable!());
            self.handle
                .mutate_and_persist(|s| {
                    s.ultra_mut().expect("ultra-plan session").plan = Some(plan);
                })
                .await;
            self.handle.transition(Phase::Refresh).await?;
        } else {
            self.handle
                .mutate_and_persist(|s| {
                    s.ultra_mut().expect("ultra-plan session").candidate_plans = plans;
                })
                .await;
            self.handle.transition(Phase::PlanSelection).await?;
        }

        Ok(())
    }

    // -- Refresh ----------------------------------------------------------

    /// Verify the base branch still exists and reset the execution
    /// cursor before entering the scheduler.
    async fn run_refresh(&self) -> Result<()> {
        let base = self.handle.with_read(|s| s.config.base_branch.clone());
        if !self.git.branch_exists(&base)? {
            self.handle
                .fail(format!("base branch {base:?} does not exist"))
                .await;
            return Ok(());
        }

        self.handle
            .mutate_and_persist(|s| {
                let ultra = s.ultra_mut().expect("ultra-plan session");
                ultra.current_group = 0;
                ultra.group_decision = None;
            })
            .await;
        self.handle.transition(Phase::Executing).await
    }

    // -- Executing --------------------------------------------------------

    /// Run the scheduler. Returns `true` when parked behind a group
    /// decision.
    async fn run_executing(&self) -> Result<bool> {
        let scheduler = TaskScheduler::new(
            self.handle.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.git),
            self.scheduler_config.clone(),
        );

        let outcome = match scheduler.run().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.handle.fail(format!("{e:#}")).await;
                return Ok(false);
            }
        };

        match outcome {
            SchedulerOutcome::Completed => {
                self.handle.transition(Phase::Synthesis).await?;
                Ok(false)
            }
            SchedulerOutcome::AwaitingDecision => Ok(true),
            SchedulerOutcome::Failed { failed_tasks } => {
                self.handle
                    .fail(format!("group failed: {}", failed_tasks.join(", ")))
                    .await;
                Ok(false)
            }
            SchedulerOutcome::Cancelled => {
                self.handle.mark_cancelled().await;
                Ok(false)
            }
        }
    }

    // -- Synthesis / revision ---------------------------------------------

    /// The branch synthesis and revision work on: rooted on the last
    /// consolidated group branch.
    fn integration_branch(&self) -> String {
        let (prefix, short_id) = self
            .handle
            .with_read(|s| (s.config.branch_prefix.clone(), s.short_id()));
        GitRepo::branch_name(&prefix, &short_id, "integration")
    }

    async fn run_synthesis_cycle(&self) -> Result<()> {
        let cancel = self.handle.cancel_token();
        let last_group_branch = self.handle.with_read(|s| {
            s.ultra()
                .and_then(|u| u.group_branches.last().cloned())
        });
        let Some(last_group_branch) = last_group_branch else {
            self.handle
                .fail("synthesis reached with no consolidated groups")
                .await;
            return Ok(());
        };

        let branch = self.integration_branch();
        let worktree = self
            .git
            .create_worktree(&branch, Some(&last_group_branch))
            .context("failed to create integration worktree")?;

        let (short_id, max_rounds) = self
            .handle
            .with_read(|s| (s.short_id(), s.config.max_revision_rounds));

        loop {
            let round = self
                .handle
                .with_read(|s| s.ultra().map(|u| u.revision_round).unwrap_or(0));

            let prompt = self.handle.with_read(|s| {
                let plan = s
                    .ultra()
                    .and_then(|u| u.plan.as_ref())
                    .expect("accepted plan");
                prompts::synthesis_prompt(plan, round)
            });

            let spec = InstanceSpec::new(short_id.clone(), "synthesis", prompt);
            let instance = self
                .broker
                .create_in_worktree(spec, &worktree.path, &branch)
                .await?;
            self.broker.start(instance.id).await?;

            let payload = match sentinel::await_sentinel::<SynthesisPayload>(
                &worktree.path,
                SentinelKind::SynthesisComplete,
                self.poll_interval,
                &cancel,
            )
            .await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    let _ = self.broker.stop(instance.id).await;
                    self.handle.mark_cancelled().await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.broker.stop(instance.id).await;
                    self.handle.fail(format!("synthesis sentinel: {e}")).await;
                    return Ok(());
                }
            };
            let _ = self.broker.stop(instance.id).await;

            if !payload.needs_revision() || round >= max_rounds {
                if payload.needs_revision() {
                    tracing::warn!(
                        round,
                        max_rounds,
                        "revision cap reached, consolidating with known issues"
                    );
                }
                self.handle
                    .mutate_and_persist(|s| {
                        s.ultra_mut().expect("ultra-plan session").final_branch =
                            Some(branch.clone());
                    })
                    .await;
                self.handle.transition(Phase::Consolidating).await?;
                return Ok(());
            }

            // Revision round: one agent per affected task, sequentially,
            // in the integration worktree.
            self.handle.transition(Phase::Revision).await?;
            let next_round = round + 1;
            self.handle
                .mutate_and_persist(|s| {
                    s.ultra_mut().expect("ultra-plan session").revision_round = next_round;
                })
                .await;

            for task_id in &payload.tasks_affected {
                let issues: Vec<String> = payload
                    .issues_found
                    .iter()
                    .filter(|i| {
                        i.severity.drives_revision()
                            && i.task_id
                                .as_deref()
                                .map(|t| t == task_id.as_str())
                                .unwrap_or(true)
                    })
                    .map(|i| i.description.clone())
                    .collect();
                if issues.is_empty() {
                    continue;
                }

                let prompt = self.handle.with_read(|s| {
                    let plan = s
                        .ultra()
                        .and_then(|u| u.plan.as_ref())
                        .expect("accepted plan");
                    plan.task(task_id)
                        .map(|task| prompts::revision_prompt(task, next_round, &issues))
                });
                let Some(prompt) = prompt else {
                    tracing::warn!(task = %task_id, "synthesis named an unknown task, skipping");
                    continue;
                };

                let spec = InstanceSpec::new(
                    short_id.clone(),
                    format!("revision-{task_id}"),
                    prompt,
                );
                let instance = self
                    .broker
                    .create_in_worktree(spec, &worktree.path, &branch)
                    .await?;
                self.broker.start(instance.id).await?;

                match sentinel::await_sentinel::<RevisionPayload>(
                    &worktree.path,
                    SentinelKind::RevisionComplete,
                    self.poll_interval,
                    &cancel,
                )
                .await
                {
                    Ok(Some(revision)) => {
                        tracing::info!(
                            task = %task_id,
                            round = revision.revision_round,
                            "revision applied"
                        );
                    }
                    Ok(None) => {
                        let _ = self.broker.stop(instance.id).await;
                        self.handle.mark_cancelled().await;
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = self.broker.stop(instance.id).await;
                        self.handle.fail(format!("revision sentinel: {e}")).await;
                        return Ok(());
                    }
                }
                let _ = self.broker.stop(instance.id).await;
            }

            self.handle.transition(Phase::Synthesis).await?;
        }
    }

    // -- Consolidating ----------------------------------------------------

    async fn run_consolidating(&self) -> Result<()> {
        let delegated = self
            .handle
            .with_read(|s| s.config.delegated_consolidation);

        if delegated {
            self.run_delegated_consolidation().await?;
        } else {
            let (final_branch, push) = self.handle.with_read(|s| {
                (
                    s.ultra().and_then(|u| u.final_branch.clone()),
                    s.config.push_branches,
                )
            });
            if let Some(branch) = final_branch {
                if push {
                    if let Err(e) = self.git.push_branch(&branch) {
                        tracing::warn!(branch = %branch, error = %e, "final push failed (non-fatal)");
                    }
                }
            }
        }

        if self.handle.phase().is_terminal() {
            return Ok(());
        }

        self.handle.transition(Phase::Complete).await?;
        let summary = self.handle.with_read(|s| {
            s.ultra()
                .and_then(|u| u.final_branch.clone())
                .map(|b| format!("completed on branch {b}"))
                .unwrap_or_else(|| "completed".to_string())
        });
        self.handle
            .observer()
            .on_finished(self.handle.id(), true, &summary);
        Ok(())
    }

    /// Delegated mode: a consolidator agent does the work and reports
    /// through its sentinel. Post-conditions match the direct path: a
    /// recorded final branch.
    async fn run_delegated_consolidation(&self) -> Result<()> {
        let cancel = self.handle.cancel_token();
        let (objective, short_id, group_branches, final_branch) = self.handle.with_read(|s| {
            let ultra = s.ultra().expect("ultra-plan session");
            (
                s.objective.clone(),
                s.short_id(),
                ultra.group_branches.clone(),
                ultra.final_branch.clone(),
            )
        });
        let Some(final_branch) = final_branch else {
            self.handle
                .fail("delegated consolidation with no final branch")
                .await;
            return Ok(());
        };

        let branch = self.integration_branch();
        let worktree = self.git.create_worktree(&branch, Some(&final_branch))?;

        let spec = InstanceSpec::new(
            short_id,
            "consolidation",
            prompts::consolidation_prompt(&objective, &group_branches),
        );
        let instance = self
            .broker
            .create_in_worktree(spec, &worktree.path, &branch)
            .await?;
        self.broker.start(instance.id).await?;

        let payload = match sentinel::await_sentinel::<ConsolidationPayload>(
            &worktree.path,
            SentinelKind::ConsolidationComplete,
            self.poll_interval,
            &cancel,
        )
        .await
        {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let _ = self.broker.stop(instance.id).await;
                self.handle.mark_cancelled().await;
                return Ok(());
            }
            Err(e) => {
                let _ = self.broker.stop(instance.id).await;
                self.handle.fail(format!("consolidation sentinel: {e}")).await;
                return Ok(());
            }
        };
        let _ = self.broker.stop(instance.id).await;

        if payload.status == ConsolidationStatus::Failed {
            self.handle
                .fail("delegated consolidation reported failure")
                .await;
        }
        Ok(())
    }
}

/// Select one of the candidate plans collected during planning. Resolves
/// a session parked in `PlanSelection`; re-run the driver afterwards.
pub async fn select_plan(handle: &SessionHandle, index: usize) -> Result<()> {
    if handle.phase() != Phase::PlanSelection {
        bail!("session is not awaiting plan selection");
    }

    let selected: Option<Plan> = handle.mutate(|s| {
        let ultra = s.ultra_mut()?;
        if index >= ultra.candidate_plans.len() {
            return None;
        }
        let plan = ultra.candidate_plans.remove(index);
        ultra.candidate_plans.clear();
        ultra.plan = Some(plan.clone());
        Some(plan)
    });

    let Some(plan) = selected else {
        bail!("no candidate plan at index {index}");
    };

    handle.persist().await;
    handle.transition(Phase::Refresh).await?;
    tracing::info!(plan = %plan.summary, "plan selected");
    Ok(())
}

