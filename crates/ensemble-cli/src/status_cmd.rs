//! Session inspection commands: status, list, delete.

use anyhow::Result;

use ensemble_state::session::{ModePayload, Session};
use ensemble_state::store::SessionStore;

use crate::config::EnsembleConfig;
use crate::infra::{Infra, find_session};

/// `ensemble list`: every stored session, oldest first.
pub async fn run_list(config: EnsembleConfig) -> Result<()> {
    let infra = Infra::build(&config)?;
    let sessions = infra.store.list().await?;

    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<14}  objective",
        "id", "mode", "phase"
    );
    for session in sessions {
        let objective: String = session.objective.chars().take(48).collect();
        println!(
            "{:<36}  {:<12}  {:<14}  {objective}",
            session.id,
            session.mode().to_string(),
            session.phase.to_string(),
        );
    }
    Ok(())
}

/// `ensemble status <session>`: one session in detail.
pub async fn run_status(config: EnsembleConfig, id_or_prefix: String) -> Result<()> {
    let infra = Infra::build(&config)?;
    let session = find_session(&infra.store, &id_or_prefix).await?;
    print_session(&session);
    Ok(())
}

/// `ensemble delete <session>`: remove a stored session document.
pub async fn run_delete(config: EnsembleConfig, id_or_prefix: String) -> Result<()> {
    let infra = Infra::build(&config)?;
    let session = find_session(&infra.store, &id_or_prefix).await?;
    infra.store.delete(session.id).await?;
    println!("session {} deleted", session.id);
    Ok(())
}

fn print_session(session: &Session) {
    println!("session   {}", session.id);
    println!("mode      {}", session.mode());
    println!("phase     {}", session.phase);
    println!("objective {}", session.objective);
    println!("created   {}", session.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(completed) = session.completed_at {
        println!("completed {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &session.error {
        println!("error     {error}");
    }

    match &session.payload {
        ModePayload::UltraPlan(ultra) => {
            let Some(plan) = &ultra.plan else {
                println!("plan      (none yet)");
                return;
            };
            println!("plan      {}", plan.summary);
            println!(
                "groups    {}/{} consolidated",
                ultra.group_branches.len(),
                plan.execution_order.len()
            );
            for (index, group) in plan.execution_order.iter().enumerate() {
                println!("  group {}:", index + 1);
                for task_id in group {
                    let state = if ultra.completed.contains(task_id) {
                        let commits = ultra.task_commit_counts.get(task_id).copied().unwrap_or(0);
                        format!("completed ({commits} commits)")
                    } else if ultra.failed.contains(task_id) {
                        "failed".to_string()
                    } else if ultra.running.contains_key(task_id) {
                        "running".to_string()
                    } else {
                        "pending".to_string()
                    };
                    println!("    {task_id:<24} {state}");
                }
            }
            if let Some(decision) = &ultra.group_decision {
                if decision.awaiting_decision {
                    println!(
                        "decision  group {} awaiting: resume-partial or retry-failed",
                        decision.group_index + 1
                    );
                }
            }
            if let Some(branch) = &ultra.final_branch {
                println!("final     {branch}");
            }
        }
        ModePayload::Adversarial(adv) => {
            println!(
                "rounds    {}/{} (minimum score {})",
                adv.round,
                adv.round_cap,
                adv.effective_minimum()
            );
            for round in &adv.rounds {
                let review = round
                    .review
                    .as_ref()
                    .map(|r| format!("score {} approved={}", r.score, r.approved))
                    .unwrap_or_else(|| "no review yet".to_string());
                println!("  round {}: {review}", round.round);
            }
        }
        ModePayload::Iterative(iter) => {
            println!(
                "loop      {}/{} iterations, phrase {:?}",
                iter.iterations.len(),
                iter.iteration_cap,
                iter.completion_phrase
            );
            let with_commits = iter.iterations.iter().filter(|i| i.had_commits).count();
            println!("          {with_commits} iterations produced commits");
        }
        ModePayload::TripleShot(ts) => {
            for attempt in &ts.attempts {
                println!(
                    "  attempt {}: {:?} {}",
                    attempt.index,
                    attempt.status,
                    attempt.branch.as_deref().unwrap_or("-")
                );
            }
            if let Some(eval) = &ts.evaluation {
                println!(
                    "judge     winner={} strategy={:?}",
                    eval.winner_index, eval.merge_strategy
                );
            }
        }
    }
}
