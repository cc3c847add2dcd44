//! Claude Code broker adapter.
//!
//! Spawns the `claude` CLI in print mode inside a worktree, feeds it the
//! composed prompt on stdin, and derives the observable
//! [`InstanceStatus`] from process state, output quiescence, and a
//! per-instance deadline:
//!
//! - process exited 0            -> `Completed`
//! - process exited non-zero     -> `Error`
//! - alive, past deadline        -> `Timeout`
//! - alive, silent past the stuck threshold -> `Stuck`
//! - alive, silent past the idle threshold  -> `WaitingForInput`
//! - otherwise                   -> `Working`
//!
//! Stdin stays open after the prompt so the iterative-loop driver can
//! re-prompt the same process via [`InstanceBroker::send_input`].

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::git::GitRepo;

use super::{InstanceBroker, InstanceHandle, InstanceSpec, InstanceStatus};

/// Configuration for the Claude Code broker.
#[derive(Debug, Clone)]
pub struct ClaudeBrokerConfig {
    /// Path to the `claude` binary. Defaults to `"claude"` on `$PATH`.
    pub binary_path: String,
    /// Branch prefix for worktrees this broker creates.
    pub branch_prefix: String,
    /// Base branch used by [`InstanceBroker::create`].
    pub base_branch: String,
    /// Wall-time limit per instance; past it the status reads `Timeout`.
    pub timeout: Duration,
    /// Output quiet period after which an alive instance reads
    /// `WaitingForInput`.
    pub idle_threshold: Duration,
    /// Output quiet period after which an alive instance reads `Stuck`.
    pub stuck_threshold: Duration,
    /// Tools the agent may use.
    pub allowed_tools: String,
}

impl Default for ClaudeBrokerConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            branch_prefix: "ensemble".to_string(),
            base_branch: "main".to_string(),
            timeout: Duration::from_secs(1800),
            idle_threshold: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(300),
            allowed_tools: "Bash,Read,Edit,Write,Glob,Grep".to_string(),
        }
    }
}

/// Per-instance bookkeeping.
struct InstanceState {
    handle: InstanceHandle,
    prompt: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    /// Accumulated stdout, shared with the reader task.
    output: Arc<std::sync::Mutex<Vec<u8>>>,
    /// Updated by the reader task on every chunk.
    last_output: Arc<std::sync::Mutex<Instant>>,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    /// Recorded once the child has been reaped.
    exit: Option<ExitStatus>,
}

/// Broker implementation backed by the Claude Code CLI.
pub struct ClaudeBroker {
    config: ClaudeBrokerConfig,
    git: GitRepo,
    instances: Arc<Mutex<HashMap<Uuid, InstanceState>>>,
}

impl std::fmt::Debug for ClaudeBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeBroker")
            .field("binary_path", &self.config.binary_path)
            .field("branch_prefix", &self.config.branch_prefix)
            .finish()
    }
}

impl ClaudeBroker {
    pub fn new(config: ClaudeBrokerConfig, git: GitRepo) -> Self {
        Self {
            config,
            git,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn register(&self, handle: InstanceHandle, prompt: String) -> InstanceHandle {
        let state = InstanceState {
            handle: handle.clone(),
            prompt,
            child: None,
            stdin: None,
            output: Arc::new(std::sync::Mutex::new(Vec::new())),
            last_output: Arc::new(std::sync::Mutex::new(Instant::now())),
            started_at: None,
            deadline: None,
            exit: None,
        };
        self.instances.lock().await.insert(handle.id, state);
        handle
    }
}

#[async_trait]
impl InstanceBroker for ClaudeBroker {
    async fn create(&self, spec: InstanceSpec) -> Result<InstanceHandle> {
        let base = self.config.base_branch.clone();
        self.create_from_branch(spec, &base).await
    }

    async fn create_in_worktree(
        &self,
        spec: InstanceSpec,
        worktree: &Path,
        branch: &str,
    ) -> Result<InstanceHandle> {
        let handle = InstanceHandle {
            id: Uuid::new_v4(),
            worktree: worktree.to_path_buf(),
            branch: branch.to_string(),
        };
        Ok(self.register(handle, spec.prompt).await)
    }

    async fn create_from_branch(
        &self,
        spec: InstanceSpec,
        base_branch: &str,
    ) -> Result<InstanceHandle> {
        let branch = GitRepo::branch_name(
            &self.config.branch_prefix,
            &spec.session_short_id,
            &spec.role,
        );
        let entry = self
            .git
            .create_worktree(&branch, Some(base_branch))
            .with_context(|| {
                format!("failed to create worktree for {branch} from {base_branch}")
            })?;

        let handle = InstanceHandle {
            id: Uuid::new_v4(),
            worktree: entry.path,
            branch,
        };
        Ok(self.register(handle, spec.prompt).await)
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let state = instances
            .get_mut(&id)
            .with_context(|| format!("instance {id} not found"))?;

        if state.child.is_some() || state.exit.is_some() {
            // Already started; start is idempotent.
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--allowedTools")
            .arg(&self.config.allowed_tools)
            .current_dir(&state.handle.worktree)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.config.binary_path
            )
        })?;

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // Feed the prompt. Stdin stays open for later send_input calls.
        if let Some(stdin) = stdin.as_mut() {
            let prompt = format!("{}\n", state.prompt);
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(instance = %id, error = %e, "failed to write prompt to agent stdin");
            }
            let _ = stdin.flush().await;
        }

        let now = Instant::now();
        state.stdin = stdin;
        state.started_at = Some(now);
        state.deadline = Some(now + self.config.timeout);
        *state.last_output.lock().unwrap_or_else(|e| e.into_inner()) = now;

        // Reader task: accumulate stdout and track quiescence.
        if let Some(mut stdout) = stdout {
            let output = Arc::clone(&state.output);
            let last_output = Arc::clone(&state.last_output);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            output
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .extend_from_slice(&buf[..n]);
                            *last_output.lock().unwrap_or_else(|e| e.into_inner()) =
                                Instant::now();
                        }
                        Err(e) => {
                            warn!(instance = %id, error = %e, "error reading agent stdout");
                            break;
                        }
                    }
                }
            });
        }

        state.child = Some(child);
        debug!(instance = %id, worktree = %state.handle.worktree.display(), "agent started");
        Ok(())
    }

    async fn stop(&self, id: Uuid) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let Some(state) = instances.get_mut(&id) else {
            // Unknown id: stop is idempotent.
            return Ok(());
        };

        let Some(mut child) = state.child.take() else {
            return Ok(());
        };

        // SIGTERM first for a graceful exit, then SIGKILL.
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from a child this broker spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(instance = %id, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        let exit = match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                debug!(instance = %id, "agent exited after SIGTERM");
                Some(status)
            }
            _ => {
                debug!(instance = %id, "agent did not exit after SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        };

        state.stdin = None;
        state.exit = exit;
        Ok(())
    }

    async fn status(&self, id: Uuid) -> Result<InstanceStatus> {
        let mut instances = self.instances.lock().await;
        let state = instances
            .get_mut(&id)
            .with_context(|| format!("instance {id} not found"))?;

        if state.started_at.is_none() {
            return Ok(InstanceStatus::Pending);
        }

        if let Some(exit) = state.exit {
            return Ok(if exit.success() {
                InstanceStatus::Completed
            } else {
                InstanceStatus::Error
            });
        }

        let Some(child) = state.child.as_mut() else {
            // Started but no child and no exit status: the stop path could
            // not reap it. Report an error state rather than guessing.
            return Ok(InstanceStatus::Error);
        };

        match child.try_wait() {
            Ok(Some(exit)) => {
                state.exit = Some(exit);
                state.child = None;
                Ok(if exit.success() {
                    InstanceStatus::Completed
                } else {
                    InstanceStatus::Error
                })
            }
            Ok(None) => {
                let now = Instant::now();
                if state.deadline.is_some_and(|d| now >= d) {
                    return Ok(InstanceStatus::Timeout);
                }
                let quiet = now.duration_since(
                    *state.last_output.lock().unwrap_or_else(|e| e.into_inner()),
                );
                if quiet >= self.config.stuck_threshold {
                    Ok(InstanceStatus::Stuck)
                } else if quiet >= self.config.idle_threshold {
                    Ok(InstanceStatus::WaitingForInput)
                } else {
                    Ok(InstanceStatus::Working)
                }
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "error checking agent process status");
                Ok(InstanceStatus::Error)
            }
        }
    }

    async fn output(&self, id: Uuid) -> Result<Vec<u8>> {
        let instances = self.instances.lock().await;
        let state = instances
            .get(&id)
            .with_context(|| format!("instance {id} not found"))?;
        let output = state.output.lock().unwrap_or_else(|e| e.into_inner());
        Ok(output.clone())
    }

    async fn send_input(&self, id: Uuid, bytes: &[u8]) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let state = instances
            .get_mut(&id)
            .with_context(|| format!("instance {id} not found"))?;

        let Some(stdin) = state.stdin.as_mut() else {
            bail!("instance {id} has no open stdin (not started or already stopped)");
        };

        stdin
            .write_all(bytes)
            .await
            .with_context(|| format!("failed to write to instance {id} stdin"))?;
        stdin.flush().await?;

        // The new prompt counts as activity: the status returns to
        // working until the agent goes quiet again.
        *state.last_output.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Option<InstanceHandle> {
        self.instances.lock().await.get(&id).map(|s| s.handle.clone())
    }
}
