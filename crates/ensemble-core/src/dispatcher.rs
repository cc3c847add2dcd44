//! Phase dispatcher: shared session handle, transitions, persistence.
//!
//! Every workflow driver owns a [`SessionHandle`]: the session behind a
//! single reader-writer lock, the persistence store, the observer, and
//! the cancellation token. A phase transition is atomic in three steps:
//! update the phase under the write lock, persist the session, invoke the
//! observer callback. Persistence failures are logged and do not abort
//! the transition -- the in-memory state is authoritative.
//!
//! The lock is never held across blocking I/O: mutation closures run
//! synchronously under the lock, persistence clones the session under a
//! read lock and saves outside it, and observers are called with no lock
//! held at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ensemble_state::phase::{Phase, is_valid_transition};
use ensemble_state::session::Session;
use ensemble_state::store::SessionStore;

use crate::observer::WorkflowObserver;

/// Distinguished error string recorded on user cancellation.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Shared handle to one session and its collaborators.
pub struct SessionHandle {
    session: Arc<RwLock<Session>>,
    store: Arc<dyn SessionStore>,
    observer: Arc<dyn WorkflowObserver>,
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

impl Clone for SessionHandle {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            store: Arc::clone(&self.store),
            observer: Arc::clone(&self.observer),
            cancel: self.cancel.clone(),
            cancel_requested: Arc::clone(&self.cancel_requested),
        }
    }
}

impl SessionHandle {
    pub fn new(
        session: Session,
        store: Arc<dyn SessionStore>,
        observer: Arc<dyn WorkflowObserver>,
    ) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
            store,
            observer,
            cancel: CancellationToken::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.with_read(|s| s.id)
    }

    pub fn phase(&self) -> Phase {
        self.with_read(|s| s.phase)
    }

    pub fn observer(&self) -> Arc<dyn WorkflowObserver> {
        Arc::clone(&self.observer)
    }

    /// Token monitors and sleeps select against.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. Returns `true` only for the first request;
    /// repeated requests are no-ops so cancel produces one transition.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Run a closure under the read lock.
    pub fn with_read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let guard = self.session.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Run a closure under the write lock. Does not persist; pair with
    /// [`Self::persist`] for observable transitions.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Mutate under the write lock, then persist.
    pub async fn mutate_and_persist<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let result = self.mutate(f);
        self.persist().await;
        result
    }

    /// Persist the session. The session is cloned under the read lock and
    /// written outside it; failures are logged, never fatal.
    pub async fn persist(&self) {
        let snapshot = self.with_read(|s| s.clone());
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(
                session_id = %snapshot.id,
                error = %e,
                "failed to persist session (continuing with in-memory state)"
            );
        }
    }

    /// Execute a phase transition.
    ///
    /// Steps: validate the edge and update the phase under the write
    /// lock, persist, then invoke the observer's `on_phase_change`
    /// without the lock.
    pub async fn transition(&self, to: Phase) -> Result<()> {
        let (id, from) = {
            let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
            let from = guard.phase;
            if !is_valid_transition(guard.mode(), from, to) {
                bail!(
                    "invalid phase transition: {} -> {} for {} session {}",
                    from,
                    to,
                    guard.mode(),
                    guard.id
                );
            }

            guard.phase = to;
            if guard.started_at.is_none() {
                guard.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                guard.completed_at = Some(Utc::now());
            }
            (guard.id, from)
        };

        self.persist().await;
        self.observer.on_phase_change(id, from, to);
        Ok(())
    }

    /// Record a fatal error and move to `Failed`. No-op (with a warning)
    /// when the session is already terminal: no further transitions occur
    /// after a fatal error.
    pub async fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        let already_terminal = self.with_read(|s| s.phase.is_terminal());
        if already_terminal {
            tracing::warn!(
                session_id = %self.id(),
                error = %error,
                "ignoring failure on already-terminal session"
            );
            return;
        }

        self.mutate(|s| {
            s.error = Some(error.clone());
        });
        match self.transition(Phase::Failed).await {
            Ok(()) => {
                // Terminal failure callback, delivered exactly once.
                self.observer.on_finished(self.id(), false, &error);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id(), error = %e, "failed-phase transition rejected");
            }
        }
    }

    /// Mark the session cancelled: phase `Failed` with the distinguished
    /// error string.
    pub async fn mark_cancelled(&self) {
        self.fail(CANCELLED_BY_USER).await;
    }
}
