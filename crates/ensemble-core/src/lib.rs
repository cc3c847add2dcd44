//! Workflow coordinator for interactive coding agents.
//!
//! `ensemble-core` drives multi-phase software-engineering workflows: a
//! user objective becomes a plan, the plan's tasks run as parallel agent
//! instances in isolated git worktrees, finished groups are cherry-picked
//! into a linear branch chain, and alternative top-level drivers cover
//! the adversarial, iterative-loop, and triple-shot modes. Agents signal
//! completion exclusively through sentinel files in their worktrees.
//!
//! # Architecture
//!
//! ```text
//! driver (ultraplan | adversarial | iterative | tripleshot)
//!   |- SessionHandle          phase dispatcher + persistence + observer
//!   |- TaskScheduler          group execution, monitors, retries
//!   |    |- layering          ready set + execution order
//!   |    |- verify            commit-count grading
//!   |    '- consolidate       cherry-pick chain per group
//!   |- InstanceBroker         agent lifecycle + worktree binding
//!   |- sentinel               completion-file protocol
//!   '- GitRepo                worktree / branch plumbing
//! ```

pub mod broker;
pub mod consolidate;
pub mod dispatcher;
pub mod drivers;
pub mod git;
pub mod layering;
pub mod observer;
pub mod prompts;
pub mod recover;
pub mod scheduler;
pub mod sentinel;
pub mod verify;

pub use broker::{ClaudeBroker, InstanceBroker, InstanceHandle, InstanceSpec, InstanceStatus};
pub use consolidate::{ConsolidateError, GroupConsolidation, consolidate_group};
pub use dispatcher::{CANCELLED_BY_USER, SessionHandle};
pub use drivers::{AdversarialDriver, IterativeDriver, TripleShotDriver, UltraPlanDriver};
pub use git::{GitError, GitRepo};
pub use layering::{PlanError, accept_plan, compute_execution_order, ready_set, validate_plan};
pub use observer::{NoopObserver, WorkflowObserver};
pub use recover::restore_session;
pub use scheduler::{
    SchedulerConfig, SchedulerOutcome, TaskScheduler, resume_with_partial, retry_failed,
};
pub use sentinel::{SentinelError, SentinelKind};
pub use verify::{VerifyOutcome, verify_task};
