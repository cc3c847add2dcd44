//! Adversarial driver: implementer/reviewer rounds with a score gate.
//!
//! One worktree is shared between the two roles, which never run
//! concurrently. Each round the implementer commits an increment and
//! writes its sentinel; the reviewer then scores it. A review marked
//! approved but scored below the effective minimum is overridden to
//! rejected *before* any callbacks fire, with a synthetic required
//! change injected when the reviewer supplied none.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use ensemble_state::phase::Phase;
use ensemble_state::sentinels::{IncrementPayload, ReviewPayload};
use ensemble_state::session::AdversarialRound;

use crate::broker::{InstanceBroker, InstanceSpec};
use crate::dispatcher::SessionHandle;
use crate::prompts;
use crate::sentinel::{self, SentinelKind};

/// Driver for adversarial sessions.
pub struct AdversarialDriver {
    handle: SessionHandle,
    broker: Arc<dyn InstanceBroker>,
    poll_interval: Duration,
}

/// Apply the score-approval consistency check to a freshly parsed
/// review.
///
/// If the review is approved but scored below `minimum` (already
/// clamped), approval is withdrawn; an empty required-changes list gains
/// one synthetic entry naming the score and the threshold.
pub fn enforce_score_gate(review: &mut ReviewPayload, minimum: i64) {
    if review.approved && review.score < minimum {
        review.approved = false;
        if review.required_changes.is_empty() {
            review.required_changes.push(format!(
                "review was approved with score {} but the minimum passing score is {}; \
                 raise the quality of the increment until it genuinely passes",
                review.score, minimum
            ));
        }
    }
}

impl AdversarialDriver {
    pub fn new(handle: SessionHandle, broker: Arc<dyn InstanceBroker>) -> Self {
        Self {
            handle,
            broker,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run rounds until approval, the round cap, or a failure.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.handle.cancel_token();

        loop {
            if cancel.is_cancelled() {
                self.handle.mark_cancelled().await;
                return Ok(());
            }
            if self.handle.phase().is_terminal() {
                return Ok(());
            }

            let (round, round_cap, task, short_id, base) = self.handle.with_read(|s| {
                let adv = s.adversarial().expect("adversarial session");
                (
                    adv.round,
                    adv.round_cap,
                    adv.task.clone(),
                    s.short_id(),
                    s.config.base_branch.clone(),
                )
            });

            // StartImplementer: round 1 allocates the worktree, later
            // rounds reuse it.
            let (worktree, branch) = self.ensure_worktree(&short_id, &base).await?;

            let implementer_prompt = self.handle.with_read(|s| {
                let adv = s.adversarial().expect("adversarial session");
                prompts::implementer_prompt(&adv.task, round, adv.previous_review())
            });

            if self.handle.phase() != Phase::Implementing {
                self.handle.transition(Phase::Implementing).await?;
            }

            let implementer = self
                .broker
                .create_in_worktree(
                    InstanceSpec::new(short_id.clone(), format!("implementer-{round}"), implementer_prompt),
                    &worktree,
                    &branch,
                )
                .await?;
            self.broker.start(implementer.id).await?;

            let increment = match sentinel::await_sentinel::<IncrementPayload>(
                &worktree,
                SentinelKind::AdversarialIncrement,
                self.poll_interval,
                &cancel,
            )
            .await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    let _ = self.broker.stop(implementer.id).await;
                    self.handle.mark_cancelled().await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.broker.stop(implementer.id).await;
                    self.handle.fail(format!("increment sentinel: {e}")).await;
                    return Ok(());
                }
            };
            let _ = self.broker.stop(implementer.id).await;

            if increment.is_failed() {
                let summary = increment.summary.clone();
                self.record_increment(round, increment).await;
                self.handle
                    .fail(format!("implementer reported failure in round {round}: {summary}"))
                    .await;
                return Ok(());
            }

            self.record_increment(round, increment.clone()).await;

            // StartReviewer.
            let minimum = self
                .handle
                .with_read(|s| s.adversarial().expect("adversarial session").effective_minimum());
            self.handle.transition(Phase::Reviewing).await?;

            let reviewer = self
                .broker
                .create_in_worktree(
                    InstanceSpec::new(
                        short_id.clone(),
                        format!("reviewer-{round}"),
                        prompts::reviewer_prompt(&task, round, &increment.summary, minimum),
                    ),
                    &worktree,
                    &branch,
                )
                .await?;
            self.broker.start(reviewer.id).await?;

            let mut review = match sentinel::await_sentinel::<ReviewPayload>(
                &worktree,
                SentinelKind::AdversarialReview,
                self.poll_interval,
                &cancel,
            )
            .await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    let _ = self.broker.stop(reviewer.id).await;
                    self.handle.mark_cancelled().await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.broker.stop(reviewer.id).await;
                    self.handle.fail(format!("review sentinel: {e}")).await;
                    return Ok(());
                }
            };
            let _ = self.broker.stop(reviewer.id).await;

            // Consistency check happens before any approved/rejected
            // callback can observe the review.
            enforce_score_gate(&mut review, minimum);
            let approved = review.approved;
            self.record_review(round, review).await;

            if approved {
                self.handle
                    .mutate_and_persist(|s| {
                        s.completed_at = Some(Utc::now());
                    })
                    .await;
                self.handle.transition(Phase::Approved).await?;
                self.handle.transition(Phase::Complete).await?;
                tracing::info!(round, "adversarial session approved");
                self.handle.observer().on_finished(
                    self.handle.id(),
                    true,
                    &format!("approved in round {round}"),
                );
                return Ok(());
            }

            if round >= round_cap {
                self.handle
                    .fail(format!("round cap {round_cap} reached without approval"))
                    .await;
                return Ok(());
            }

            self.handle
                .mutate_and_persist(|s| {
                    s.adversarial_mut().expect("adversarial session").round = round + 1;
                })
                .await;
            self.handle.transition(Phase::Implementing).await?;
        }
    }

    /// Create the shared worktree on round 1; reuse it afterwards.
    async fn ensure_worktree(&self, short_id: &str, base: &str) -> Result<(PathBuf, String)> {
        let existing = self.handle.with_read(|s| {
            let adv = s.adversarial().expect("adversarial session");
            adv.worktree.clone().zip(adv.branch.clone())
        });
        if let Some((worktree, branch)) = existing {
            return Ok((worktree, branch));
        }

        let spec = InstanceSpec::new(short_id.to_string(), "adversarial", String::new());
        let handle = self
            .broker
            .create_from_branch(spec, base)
            .await
            .context("failed to allocate adversarial worktree")?;
        // The placeholder instance only exists for its worktree; it is
        // never started.
        let _ = self.broker.stop(handle.id).await;

        self.handle
            .mutate_and_persist(|s| {
                let adv = s.adversarial_mut().expect("adversarial session");
                adv.worktree = Some(handle.worktree.clone());
                adv.branch = Some(handle.branch.clone());
            })
            .await;
        Ok((handle.worktree, handle.branch))
    }

    async fn record_increment(&self, round: u32, increment: IncrementPayload) {
        self.handle
            .mutate_and_persist(|s| {
                let adv = s.adversarial_mut().expect("adversarial session");
                if let Some(entry) = adv.rounds.iter_mut().find(|r| r.round == round) {
                    entry.increment = Some(increment);
                } else {
                    adv.rounds.push(AdversarialRound {
                        round,
                        increment: Some(increment),
                        review: None,
                    });
                }
            })
            .await;
    }

    async fn record_review(&self, round: u32, review: ReviewPayload) {
        self.handle
            .mutate_and_persist(|s| {
                let adv = s.adversarial_mut().expect("adversarial session");
                if let Some(entry) = adv.rounds.iter_mut().find(|r| r.round == round) {
                    entry.review = Some(review);
                } else {
                    adv.rounds.push(AdversarialRound {
                        round,
                        increment: None,
                        review: Some(review),
                    });
                }
            })
            .await;
    }
}
