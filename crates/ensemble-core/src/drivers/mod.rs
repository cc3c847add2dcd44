//! Top-level workflow drivers.
//!
//! Each driver owns one session and runs it to a terminal phase (or
//! parks it where an external command is required). All of them reuse
//! the same building blocks: the session handle, the broker, sentinel
//! polling, and the persistence-on-transition discipline.

pub mod adversarial;
pub mod iterative;
pub mod tripleshot;
pub mod ultraplan;

pub use adversarial::AdversarialDriver;
pub use iterative::IterativeDriver;
pub use tripleshot::TripleShotDriver;
pub use ultraplan::{UltraPlanDriver, select_plan};
