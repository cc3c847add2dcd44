//! Sentinel file I/O.
//!
//! Agents signal phase completion by writing a single JSON document at a
//! canonical filename inside their worktree. The coordinator polls for
//! that file, parses it, and deletes it after consuming it so the next
//! round starts from "not yet".
//!
//! Contracts:
//! - A missing file is not an error; it means the agent is not done.
//! - A parse failure is surfaced as an error; the phase fails with it.
//! - Deletion failures after a successful read are warnings only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The sentinel file a phase waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    Plan,
    TaskComplete,
    SynthesisComplete,
    RevisionComplete,
    GroupConsolidationComplete,
    ConsolidationComplete,
    AdversarialIncrement,
    AdversarialReview,
    RalphStatus,
    TripleShotComplete,
    TripleShotEvaluation,
}

impl SentinelKind {
    /// The canonical filename for this sentinel inside a worktree.
    pub fn filename(&self) -> &'static str {
        match self {
            Self::Plan => "plan.json",
            Self::TaskComplete => "task-complete.json",
            Self::SynthesisComplete => "synthesis-complete.json",
            Self::RevisionComplete => "revision-complete.json",
            Self::GroupConsolidationComplete => "group-consolidation-complete.json",
            Self::ConsolidationComplete => "consolidation-complete.json",
            Self::AdversarialIncrement => "adversarial-increment.json",
            Self::AdversarialReview => "adversarial-review.json",
            Self::RalphStatus => "ralph-status.json",
            Self::TripleShotComplete => "tripleshot-complete.json",
            Self::TripleShotEvaluation => "tripleshot-evaluation.json",
        }
    }

    /// Full path of this sentinel inside `worktree`.
    pub fn path_in(&self, worktree: &Path) -> PathBuf {
        worktree.join(self.filename())
    }
}

/// Errors from sentinel reads.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("failed to read sentinel {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed sentinel {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Whether the sentinel exists in the worktree.
pub fn exists(worktree: &Path, kind: SentinelKind) -> bool {
    kind.path_in(worktree).exists()
}

/// Read and parse the sentinel without removing it.
///
/// Returns `Ok(None)` when the file does not exist yet.
pub fn read<T: DeserializeOwned>(
    worktree: &Path,
    kind: SentinelKind,
) -> Result<Option<T>, SentinelError> {
    let path = kind.path_in(worktree);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SentinelError::Io { path, source: e }),
    };

    let payload = serde_json::from_str(&contents)
        .map_err(|e| SentinelError::Parse { path, source: e })?;
    Ok(Some(payload))
}

/// Read, parse, and delete the sentinel.
///
/// The delete makes consumption one-shot: a re-poll after `consume`
/// returns "not yet" until the agent writes again. Deletion failures are
/// logged and swallowed.
pub fn consume<T: DeserializeOwned>(
    worktree: &Path,
    kind: SentinelKind,
) -> Result<Option<T>, SentinelError> {
    let Some(payload) = read::<T>(worktree, kind)? else {
        return Ok(None);
    };

    let path = kind.path_in(worktree);
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to delete consumed sentinel"
        );
    }

    Ok(Some(payload))
}

/// Poll for a sentinel until it appears, the token is cancelled, or a
/// parse error occurs. The sentinel is consumed (deleted) on success.
///
/// Returns `Ok(None)` on cancellation.
pub async fn await_sentinel<T: DeserializeOwned>(
    worktree: &Path,
    kind: SentinelKind,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Option<T>, SentinelError> {
    loop {
        if let Some(payload) = consume::<T>(worktree, kind)? {
            return Ok(Some(payload));
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Ok(None),
        }
    }
}
