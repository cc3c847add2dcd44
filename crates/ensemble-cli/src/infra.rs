//! Shared wiring: store, git, broker, and session lookup.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use ensemble_core::broker::ClaudeBroker;
use ensemble_core::git::GitRepo;
use ensemble_state::session::Session;
use ensemble_state::store::{JsonSessionStore, SessionStore};

use crate::config::EnsembleConfig;

/// The collaborators every command needs.
pub struct Infra {
    pub store: Arc<JsonSessionStore>,
    pub git: Arc<GitRepo>,
    pub broker: Arc<ClaudeBroker>,
}

impl Infra {
    pub fn build(config: &EnsembleConfig) -> Result<Self> {
        let git = GitRepo::open(&config.session.repo_path, config.worktree_base.clone())
            .with_context(|| {
                format!(
                    "failed to open repository at {}",
                    config.session.repo_path.display()
                )
            })?;
        let broker = ClaudeBroker::new(config.broker.clone(), git.clone());

        Ok(Self {
            store: Arc::new(JsonSessionStore::new(JsonSessionStore::default_dir())),
            git: Arc::new(git),
            broker: Arc::new(broker),
        })
    }
}

/// Resolve a session by full id or unique prefix.
pub async fn find_session(store: &JsonSessionStore, id_or_prefix: &str) -> Result<Session> {
    if let Ok(id) = Uuid::parse_str(id_or_prefix) {
        return store
            .load(id)
            .await?
            .with_context(|| format!("session {id} not found"));
    }

    let needle = id_or_prefix.to_ascii_lowercase().replace('-', "");
    let matches: Vec<Session> = store
        .list()
        .await?
        .into_iter()
        .filter(|s| s.id.simple().to_string().starts_with(&needle))
        .collect();

    match matches.len() {
        0 => bail!("no session matches {id_or_prefix:?}"),
        1 => Ok(matches.into_iter().next().expect("one match")),
        n => bail!("{n} sessions match {id_or_prefix:?}; use a longer prefix"),
    }
}

/// Spawn a Ctrl-C handler that requests cancellation on the handle.
pub fn install_cancel_handler(handle: ensemble_core::dispatcher::SessionHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, stopping agents...");
            handle.request_cancel();
        }
    });
}
