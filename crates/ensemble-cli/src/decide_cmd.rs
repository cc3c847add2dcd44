//! Group-decision and plan-selection commands.

use std::sync::Arc;

use anyhow::{Result, bail};

use ensemble_core::drivers::ultraplan::select_plan;
use ensemble_core::recover::restore_session;
use ensemble_core::scheduler::{resume_with_partial, retry_failed};

use crate::config::EnsembleConfig;
use crate::infra::{Infra, find_session};
use crate::observer::ConsoleObserver;
use crate::run_cmd;

/// `ensemble decide <session> --resume-partial | --retry-failed`.
pub async fn run_decide(
    config: EnsembleConfig,
    id_or_prefix: String,
    resume_partial: bool,
    retry: bool,
) -> Result<()> {
    if resume_partial == retry {
        bail!("pass exactly one of --resume-partial or --retry-failed");
    }

    let infra = Infra::build(&config)?;
    let session = find_session(&infra.store, &id_or_prefix).await?;
    let id = session.id;

    let handle = restore_session(
        Arc::clone(&infra.store) as _,
        id,
        infra.broker.as_ref(),
        Arc::new(ConsoleObserver),
    )
    .await?;

    let pending = handle.with_read(|s| {
        s.ultra()
            .and_then(|u| u.group_decision.as_ref().map(|d| d.awaiting_decision))
            .unwrap_or(false)
    });
    if !pending {
        bail!("session {id} has no pending group decision");
    }

    if resume_partial {
        resume_with_partial(&handle, &infra.git).await?;
        println!("partial group consolidated; continuing");
    } else {
        retry_failed(&handle).await?;
        println!("failed tasks reset; continuing");
    }

    // Keep driving the session to its next stop.
    run_cmd::run_resume(config, id.to_string()).await
}

/// `ensemble select-plan <session> <index>`.
pub async fn run_select_plan(
    config: EnsembleConfig,
    id_or_prefix: String,
    index: usize,
) -> Result<()> {
    let infra = Infra::build(&config)?;
    let session = find_session(&infra.store, &id_or_prefix).await?;
    let id = session.id;

    let handle = restore_session(
        Arc::clone(&infra.store) as _,
        id,
        infra.broker.as_ref(),
        Arc::new(ConsoleObserver),
    )
    .await?;

    select_plan(&handle, index).await?;
    println!("plan {index} selected; continuing");

    run_cmd::run_resume(config, id.to_string()).await
}
