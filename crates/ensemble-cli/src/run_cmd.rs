//! Workflow launch commands: run, adversarial, loop, tripleshot, resume.

use std::sync::Arc;

use anyhow::{Result, bail};

use ensemble_core::dispatcher::SessionHandle;
use ensemble_core::drivers::ultraplan::RunOutcome;
use ensemble_core::drivers::{
    AdversarialDriver, IterativeDriver, TripleShotDriver, UltraPlanDriver,
};
use ensemble_core::recover::restore_session;
use ensemble_state::phase::WorkflowMode;
use ensemble_state::session::{
    AdversarialState, IterativeState, ModePayload, Session, TripleShotState, UltraPlanState,
};

use crate::config::EnsembleConfig;
use crate::infra::{Infra, find_session, install_cancel_handler};
use crate::observer::ConsoleObserver;

fn new_handle(infra: &Infra, session: Session) -> SessionHandle {
    let handle = SessionHandle::new(
        session,
        Arc::clone(&infra.store) as _,
        Arc::new(ConsoleObserver),
    );
    install_cancel_handler(handle.clone());
    handle
}

async fn drive_ultraplan(infra: &Infra, handle: SessionHandle) -> Result<()> {
    let driver = UltraPlanDriver::new(
        handle.clone(),
        Arc::clone(&infra.broker) as _,
        Arc::clone(&infra.git),
    );

    match driver.run().await? {
        RunOutcome::Finished => print_terminal_state(&handle),
        RunOutcome::AwaitingPlanSelection => {
            let candidates = handle.with_read(|s| {
                s.ultra()
                    .map(|u| {
                        u.candidate_plans
                            .iter()
                            .map(|p| p.summary.clone())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            });
            println!("planning produced {} candidate plans:", candidates.len());
            for (index, summary) in candidates.iter().enumerate() {
                println!("  [{index}] {summary}");
            }
            println!(
                "choose one with `ensemble select-plan {} <index>`",
                handle.id()
            );
        }
        RunOutcome::AwaitingGroupDecision => {
            // The observer already printed the decision instructions.
            println!("session {} is awaiting a group decision", handle.id());
        }
    }
    Ok(())
}

fn print_terminal_state(handle: &SessionHandle) {
    handle.with_read(|s| {
        println!("session {}: {}", s.id, s.phase);
        if let Some(error) = &s.error {
            println!("  error: {error}");
        }
        if let Some(ultra) = s.ultra() {
            if let Some(branch) = &ultra.final_branch {
                println!("  final branch: {branch}");
            }
        }
        if let Some(ts) = s.tripleshot() {
            if let Some(branch) = &ts.winning_branch {
                println!("  winning branch: {branch}");
            }
        }
    });
}

/// `ensemble run <objective>`: full ultra-plan workflow.
#[allow(clippy::too_many_arguments)]
pub async fn run_ultraplan(
    config: EnsembleConfig,
    objective: String,
    max_parallel: Option<usize>,
    retry_cap: Option<u32>,
    candidates: Option<u32>,
    delegated: bool,
    no_verify: bool,
    no_push: bool,
) -> Result<()> {
    let mut session_config = config.session.clone();
    if let Some(max_parallel) = max_parallel {
        session_config.max_parallel = max_parallel;
    }
    if let Some(retry_cap) = retry_cap {
        session_config.retry_cap = retry_cap;
    }
    if let Some(candidates) = candidates {
        session_config.plan_candidates = candidates.max(1);
    }
    session_config.delegated_consolidation = delegated;
    session_config.verify_commits = !no_verify;
    if no_push {
        session_config.push_branches = false;
    }

    let infra = Infra::build(&config)?;
    let session = Session::new(
        objective,
        session_config,
        ModePayload::UltraPlan(UltraPlanState::default()),
    );
    println!("session {} created", session.id);

    let handle = new_handle(&infra, session);
    drive_ultraplan(&infra, handle).await
}

/// `ensemble adversarial <task>`: implement/review rounds.
pub async fn run_adversarial(
    config: EnsembleConfig,
    task: String,
    rounds: Option<u32>,
    min_score: Option<i64>,
) -> Result<()> {
    let round_cap = rounds.unwrap_or(config.round_cap);
    let minimum = min_score.unwrap_or(8);

    let infra = Infra::build(&config)?;
    let session = Session::new(
        task.clone(),
        config.session.clone(),
        ModePayload::Adversarial(AdversarialState::new(task, round_cap, minimum)),
    );
    println!("session {} created", session.id);

    let handle = new_handle(&infra, session);
    AdversarialDriver::new(handle.clone(), Arc::clone(&infra.broker) as _)
        .run()
        .await?;
    print_terminal_state(&handle);
    Ok(())
}

/// `ensemble loop <prompt> --phrase <PHRASE>`: iterative completion loop.
pub async fn run_loop(
    config: EnsembleConfig,
    prompt: String,
    phrase: String,
    iterations: Option<u32>,
) -> Result<()> {
    let cap = iterations.unwrap_or(config.iteration_cap);

    let infra = Infra::build(&config)?;
    let session = Session::new(
        prompt.clone(),
        config.session.clone(),
        ModePayload::Iterative(IterativeState::new(prompt, phrase, cap)),
    );
    println!("session {} created", session.id);

    let handle = new_handle(&infra, session);
    IterativeDriver::new(
        handle.clone(),
        Arc::clone(&infra.broker) as _,
        Arc::clone(&infra.git),
    )
    .run()
    .await?;
    print_terminal_state(&handle);
    Ok(())
}

/// `ensemble tripleshot <task>`: three attempts and a judge.
pub async fn run_tripleshot(config: EnsembleConfig, task: String) -> Result<()> {
    let infra = Infra::build(&config)?;
    let session = Session::new(
        task.clone(),
        config.session.clone(),
        ModePayload::TripleShot(TripleShotState::new(task)),
    );
    println!("session {} created", session.id);

    let handle = new_handle(&infra, session);
    TripleShotDriver::new(handle.clone(), Arc::clone(&infra.broker) as _)
        .run()
        .await?;
    print_terminal_state(&handle);
    Ok(())
}

/// `ensemble resume <session>`: restore a stored session and keep going.
pub async fn run_resume(config: EnsembleConfig, id_or_prefix: String) -> Result<()> {
    let infra = Infra::build(&config)?;
    let session = find_session(&infra.store, &id_or_prefix).await?;
    let id = session.id;

    if session.phase.is_terminal() {
        bail!("session {id} already finished ({})", session.phase);
    }

    let handle = restore_session(
        Arc::clone(&infra.store) as _,
        id,
        infra.broker.as_ref(),
        Arc::new(ConsoleObserver),
    )
    .await?;
    install_cancel_handler(handle.clone());

    match handle.with_read(|s| s.mode()) {
        WorkflowMode::UltraPlan => drive_ultraplan(&infra, handle).await,
        WorkflowMode::Adversarial => {
            AdversarialDriver::new(handle.clone(), Arc::clone(&infra.broker) as _)
                .run()
                .await?;
            print_terminal_state(&handle);
            Ok(())
        }
        WorkflowMode::Iterative => {
            IterativeDriver::new(
                handle.clone(),
                Arc::clone(&infra.broker) as _,
                Arc::clone(&infra.git),
            )
            .run()
            .await?;
            print_terminal_state(&handle);
            Ok(())
        }
        WorkflowMode::TripleShot => {
            TripleShotDriver::new(handle.clone(), Arc::clone(&infra.broker) as _)
                .run()
                .await?;
            print_terminal_state(&handle);
            Ok(())
        }
    }
}
