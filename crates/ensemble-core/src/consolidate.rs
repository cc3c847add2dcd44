//! Group consolidation: cherry-picking parallel task branches into a
//! linear chain.
//!
//! Each closed execution group produces one consolidated branch. Group 0
//! roots on the repository's base branch; group *g* roots on group
//! *g-1*'s consolidated branch, taken from the explicit record rather
//! than re-derived. Tasks of the next group start from the consolidated
//! branch, which is what makes the chain linear.
//!
//! The delegated mode (a consolidator agent doing the same work and
//! reporting through its sentinel) lives in the ultra-plan driver; both
//! paths end in the same record: a named branch for the group.

use thiserror::Error;

use crate::git::{CherryPickResult, GitError, GitRepo};

/// Errors from direct consolidation.
#[derive(Debug, Error)]
pub enum ConsolidateError {
    /// A task branch's commits did not apply cleanly. The cherry-pick was
    /// aborted; the whole consolidation fails naming the offending task.
    #[error("cherry-pick conflict consolidating task {task}: {details}")]
    CherryPickConflict { task: String, details: String },

    /// The consolidated branch ended up identical to its base.
    #[error("no commits after cherry-picking {branches} branches")]
    NoCommits { branches: usize },

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Result of consolidating one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConsolidation {
    /// The consolidated branch, to be recorded for the group.
    pub branch: String,
    /// Commits on the branch relative to its base.
    pub commits: u32,
}

/// Consolidate one group directly.
///
/// `tasks` is the ordered list of `(task_id, task_branch)` pairs to
/// fold in -- only tasks with verified commits, in deterministic group
/// order. Steps:
///
/// 1. Create `<prefix>/<short-id>/group-<g+1>` from `base_branch`.
/// 2. Check it out in a temporary worktree.
/// 3. Cherry-pick each task branch's `base..head` range in order;
///    a conflict aborts and fails the consolidation.
/// 4. Count commits relative to the base; zero is a failure.
/// 5. Push (best-effort; a push failure is a warning).
/// 6. Remove the temporary worktree.
pub fn consolidate_group(
    git: &GitRepo,
    branch_prefix: &str,
    short_id: &str,
    base_branch: &str,
    group_index: usize,
    tasks: &[(String, String)],
    push: bool,
) -> Result<GroupConsolidation, ConsolidateError> {
    let branch = GitRepo::branch_name(
        branch_prefix,
        short_id,
        &format!("group-{}", group_index + 1),
    );

    tracing::info!(
        group = group_index,
        branch = %branch,
        base = base_branch,
        tasks = tasks.len(),
        "consolidating group"
    );

    let worktree = git.create_worktree(&branch, Some(base_branch))?;

    for (task_id, task_branch) in tasks {
        match git.cherry_pick_range(&worktree.path, base_branch, task_branch) {
            Ok(CherryPickResult::Applied) => {
                tracing::debug!(task = %task_id, branch = %task_branch, "cherry-picked task branch");
            }
            Ok(CherryPickResult::Conflict { details }) => {
                cleanup_worktree(git, &worktree.path);
                return Err(ConsolidateError::CherryPickConflict {
                    task: task_id.clone(),
                    details,
                });
            }
            Err(e) => {
                cleanup_worktree(git, &worktree.path);
                return Err(e.into());
            }
        }
    }

    let commits = git.count_commits_between(base_branch, &branch)?;
    if commits == 0 {
        cleanup_worktree(git, &worktree.path);
        return Err(ConsolidateError::NoCommits {
            branches: tasks.len(),
        });
    }

    if push {
        if let Err(e) = git.push_branch(&branch) {
            tracing::warn!(branch = %branch, error = %e, "push failed (non-fatal)");
        }
    }

    cleanup_worktree(git, &worktree.path);

    Ok(GroupConsolidation { branch, commits })
}

fn cleanup_worktree(git: &GitRepo, path: &std::path::Path) {
    if let Err(e) = git.remove_worktree(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove consolidation worktree");
    }
}
