mod config;
mod decide_cmd;
mod infra;
mod observer;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::EnsembleConfig;

#[derive(Parser)]
#[command(name = "ensemble", about = "Multi-phase workflow coordinator for coding agents")]
struct Cli {
    /// Repository to operate on (overrides ENSEMBLE_REPO and the config file)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a full ultra-plan workflow for an objective
    Run {
        /// The objective, free text
        objective: String,
        /// Maximum number of concurrent agents
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Retry cap for tasks that produce no commits
        #[arg(long)]
        retry_cap: Option<u32>,
        /// Number of candidate plans to generate (more than one enables
        /// plan selection)
        #[arg(long)]
        candidates: Option<u32>,
        /// Delegate consolidation to a consolidator agent
        #[arg(long)]
        delegated: bool,
        /// Credit completed agents without checking for commits
        #[arg(long)]
        no_verify: bool,
        /// Do not push consolidated branches
        #[arg(long)]
        no_push: bool,
    },
    /// Run implementer/reviewer rounds until the review passes
    Adversarial {
        /// The task, free text
        task: String,
        /// Maximum number of rounds
        #[arg(long)]
        rounds: Option<u32>,
        /// Minimum passing review score (1-10)
        #[arg(long)]
        min_score: Option<i64>,
    },
    /// Re-prompt one long-lived agent until it emits the completion phrase
    Loop {
        /// The prompt, free text
        prompt: String,
        /// Completion phrase the agent must emit between <promise> tags
        #[arg(long)]
        phrase: String,
        /// Iteration cap
        #[arg(long)]
        iterations: Option<u32>,
    },
    /// Run three parallel attempts and let a judge pick the winner
    Tripleshot {
        /// The task, free text
        task: String,
    },
    /// Resume a stored session from where it stopped
    Resume {
        /// Session id or unique prefix
        session: String,
    },
    /// Resolve a group that finished with mixed results
    Decide {
        /// Session id or unique prefix
        session: String,
        /// Consolidate the succeeded tasks and move on
        #[arg(long)]
        resume_partial: bool,
        /// Reset and re-dispatch the failed tasks within the group
        #[arg(long)]
        retry_failed: bool,
    },
    /// Choose one of the candidate plans from planning
    SelectPlan {
        /// Session id or unique prefix
        session: String,
        /// Candidate index
        index: usize,
    },
    /// Show one session in detail
    Status {
        /// Session id or unique prefix
        session: String,
    },
    /// List all stored sessions
    List,
    /// Delete a stored session document
    Delete {
        /// Session id or unique prefix
        session: String,
    },
}

/// `ensemble init`: write the default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    config::save_config(&config::ConfigFile::default())?;
    println!("Config written to {}", path.display());
    println!("Edit workspace.repo_path before the first run.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return cmd_init(*force);
    }

    let config = EnsembleConfig::resolve(cli.repo.as_ref())?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Run {
            objective,
            max_parallel,
            retry_cap,
            candidates,
            delegated,
            no_verify,
            no_push,
        } => {
            run_cmd::run_ultraplan(
                config,
                objective,
                max_parallel,
                retry_cap,
                candidates,
                delegated,
                no_verify,
                no_push,
            )
            .await?;
        }
        Commands::Adversarial {
            task,
            rounds,
            min_score,
        } => {
            run_cmd::run_adversarial(config, task, rounds, min_score).await?;
        }
        Commands::Loop {
            prompt,
            phrase,
            iterations,
        } => {
            run_cmd::run_loop(config, prompt, phrase, iterations).await?;
        }
        Commands::Tripleshot { task } => {
            run_cmd::run_tripleshot(config, task).await?;
        }
        Commands::Resume { session } => {
            run_cmd::run_resume(config, session).await?;
        }
        Commands::Decide {
            session,
            resume_partial,
            retry_failed,
        } => {
            decide_cmd::run_decide(config, session, resume_partial, retry_failed).await?;
        }
        Commands::SelectPlan { session, index } => {
            decide_cmd::run_select_plan(config, session, index).await?;
        }
        Commands::Status { session } => {
            status_cmd::run_status(config, session).await?;
        }
        Commands::List => {
            status_cmd::run_list(config).await?;
        }
        Commands::Delete { session } => {
            status_cmd::run_delete(config, session).await?;
        }
    }

    Ok(())
}
