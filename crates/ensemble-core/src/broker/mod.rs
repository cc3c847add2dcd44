//! Instance broker -- the contract over external coding agents.
//!
//! The coordinator never talks to an agent process directly; it goes
//! through an [`InstanceBroker`], which owns worktree binding and process
//! lifetime. Each worktree is bound to at most one live instance at a
//! time.
//!
//! ```text
//! Scheduler / driver
//!     |
//!     v
//! InstanceBroker
//!     |  create(...) ----> InstanceHandle { id, worktree, branch }
//!     |  start / stop (idempotent)
//!     |  status --------> InstanceStatus
//!     |  output --------> accumulated bytes
//!     |  send_input      (iterative loop only)
//!     |  get(id)
//! ```

pub mod claude;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use claude::ClaudeBroker;

/// Observable status of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Created but not yet started.
    Pending,
    /// Running and producing output.
    Working,
    /// Alive but idle at a prompt. Single-shot agents idle here after
    /// writing their sentinel, so the scheduler treats this as a success
    /// candidate.
    WaitingForInput,
    /// Exited cleanly.
    Completed,
    /// Exited with a failure.
    Error,
    /// Exceeded its wall-time limit.
    Timeout,
    /// Alive but silent far past the idle threshold.
    Stuck,
}

impl InstanceStatus {
    /// Whether the scheduler should stop polling and hand the instance to
    /// the verifier (or fail it).
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending | Self::Working)
    }

    /// Whether this status is a success candidate for verification.
    pub fn is_success_candidate(&self) -> bool {
        matches!(self, Self::Completed | Self::WaitingForInput)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

/// Handle to a created instance: its id and worktree binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: Uuid,
    pub worktree: PathBuf,
    pub branch: String,
}

/// Request to create an instance.
///
/// `role` names what the instance is for (a task id, `implementer`,
/// `attempt-0`, ...) and becomes the last branch-name segment.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub session_short_id: String,
    pub role: String,
    pub prompt: String,
}

impl InstanceSpec {
    pub fn new(
        session_short_id: impl Into<String>,
        role: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_short_id: session_short_id.into(),
            role: role.into(),
            prompt: prompt.into(),
        }
    }
}

/// The broker contract (spec'd operations only; the agent process itself
/// is an external collaborator).
#[async_trait]
pub trait InstanceBroker: Send + Sync {
    /// Create an instance in a fresh worktree rooted on the repository's
    /// default base.
    async fn create(&self, spec: InstanceSpec) -> Result<InstanceHandle>;

    /// Create an instance bound to an existing worktree and branch.
    async fn create_in_worktree(
        &self,
        spec: InstanceSpec,
        worktree: &Path,
        branch: &str,
    ) -> Result<InstanceHandle>;

    /// Create an instance in a fresh worktree rooted on `base_branch`.
    async fn create_from_branch(
        &self,
        spec: InstanceSpec,
        base_branch: &str,
    ) -> Result<InstanceHandle>;

    /// Start the instance's agent process. Idempotent.
    async fn start(&self, id: Uuid) -> Result<()>;

    /// Stop the instance. Idempotent; unknown ids are a no-op.
    async fn stop(&self, id: Uuid) -> Result<()>;

    /// Observe the instance's status. Errors when the id is unknown
    /// (vanished instances are the caller's failure case).
    async fn status(&self, id: Uuid) -> Result<InstanceStatus>;

    /// Accumulated output of the instance so far.
    async fn output(&self, id: Uuid) -> Result<Vec<u8>>;

    /// Send bytes to the instance's stdin. Used by the iterative-loop
    /// driver to re-prompt a long-lived agent.
    async fn send_input(&self, id: Uuid, bytes: &[u8]) -> Result<()>;

    /// Look up a handle by id.
    async fn get(&self, id: Uuid) -> Option<InstanceHandle>;
}
