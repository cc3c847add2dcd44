//! Configuration file management for ensemble.
//!
//! Provides a TOML config file at `~/.config/ensemble/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ensemble_core::broker::claude::ClaudeBrokerConfig;
use ensemble_state::session::SessionConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Repository the agents operate on.
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    /// Where worktrees are created; defaults to a sibling of the repo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_base: Option<PathBuf>,
    /// Whether consolidated branches are pushed to origin.
    #[serde(default = "default_true")]
    pub push_branches: bool,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            base_branch: "main".to_string(),
            branch_prefix: "ensemble".to_string(),
            worktree_base: None,
            push_branches: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Path to the agent binary.
    pub binary_path: String,
    pub timeout_secs: u64,
    pub idle_threshold_secs: u64,
    pub stuck_threshold_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            timeout_secs: 1800,
            idle_threshold_secs: 30,
            stuck_threshold_secs: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitsSection {
    pub max_parallel: usize,
    pub retry_cap: u32,
    pub round_cap: u32,
    pub iteration_cap: u32,
    pub max_revision_rounds: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry_cap: 2,
            round_cap: 5,
            iteration_cap: 50,
            max_revision_rounds: 3,
        }
    }
}

fn default_true() -> bool {
    true
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the ensemble config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/ensemble` or
/// `~/.config/ensemble`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ensemble");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ensemble")
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // 0600: owner read/write only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration for one invocation.
#[derive(Debug)]
pub struct EnsembleConfig {
    pub session: SessionConfig,
    pub broker: ClaudeBrokerConfig,
    pub worktree_base: Option<PathBuf>,
    pub round_cap: u32,
    pub iteration_cap: u32,
}

impl EnsembleConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Repo path: `cli_repo` > `ENSEMBLE_REPO` > `workspace.repo_path` > `.`
    /// - Agent binary: `ENSEMBLE_AGENT_BIN` > `agent.binary_path` > `claude`
    pub fn resolve(cli_repo: Option<&PathBuf>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let repo_path = if let Some(repo) = cli_repo {
            repo.clone()
        } else if let Ok(repo) = std::env::var("ENSEMBLE_REPO") {
            PathBuf::from(repo)
        } else {
            file.workspace.repo_path.clone()
        };

        let binary_path = std::env::var("ENSEMBLE_AGENT_BIN")
            .unwrap_or_else(|_| file.agent.binary_path.clone());

        let session = SessionConfig {
            repo_path,
            base_branch: file.workspace.base_branch.clone(),
            branch_prefix: file.workspace.branch_prefix.clone(),
            max_parallel: file.limits.max_parallel,
            retry_cap: file.limits.retry_cap,
            agent_timeout_secs: file.agent.timeout_secs,
            verify_commits: true,
            delegated_consolidation: false,
            plan_candidates: 1,
            max_revision_rounds: file.limits.max_revision_rounds,
            push_branches: file.workspace.push_branches,
        };

        let broker = ClaudeBrokerConfig {
            binary_path,
            branch_prefix: file.workspace.branch_prefix,
            base_branch: file.workspace.base_branch,
            timeout: Duration::from_secs(file.agent.timeout_secs),
            idle_threshold: Duration::from_secs(file.agent.idle_threshold_secs),
            stuck_threshold: Duration::from_secs(file.agent.stuck_threshold_secs),
            ..Default::default()
        };

        Ok(Self {
            session,
            broker,
            worktree_base: file.workspace.worktree_base,
            round_cap: file.limits.round_cap,
            iteration_cap: file.limits.iteration_cap,
        })
    }
}
