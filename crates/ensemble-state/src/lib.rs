//! Data model and persistence for ensemble workflow sessions.
//!
//! This crate holds the serializable state of a workflow run: the
//! [`Session`](session::Session) root aggregate, the per-mode payloads, the
//! [`Plan`](plan::Plan) produced by the planning phase, the sentinel payload
//! schemas written by agents, and the [`SessionStore`](store::SessionStore)
//! persistence contract with its JSON-document implementation.
//!
//! Everything here is plain data: no process spawning, no git, no
//! scheduling. The `ensemble-core` crate builds the coordinator on top.

pub mod phase;
pub mod plan;
pub mod sentinels;
pub mod session;
pub mod store;

pub use phase::{Phase, PhaseParseError, WorkflowMode, is_valid_transition};
pub use plan::{Complexity, Plan, PlanTask};
pub use session::{
    AdversarialRound, AdversarialState, AttemptRecord, AttemptStatus, GroupDecision,
    IterationRecord, IterativeState, ModePayload, RetryState, Session, SessionConfig,
    TripleShotState, UltraPlanState, effective_minimum_score,
};
pub use store::{JsonSessionStore, MemorySessionStore, SessionStore, StoreError};
