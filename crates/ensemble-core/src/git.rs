//! Git worktree and branch plumbing.
//!
//! Every agent instance gets its own worktree under a common base
//! directory, named after its branch. Branch names follow one convention
//! throughout the coordinator, `<prefix>/<session-short-id>/<role>`, so
//! a worktree's directory, its branch, and the agent role it belongs to
//! are all derivable from each other. On top of checkout management this
//! module carries the consolidation primitives: rooting a branch on an
//! arbitrary base, counting commits between two refs, cherry-picking a
//! branch's range onto a consolidated branch, and best-effort pushes.
//!
//! Mutating operations are serialised through one internal mutex; git
//! refuses concurrent worktree mutations against a single object store.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command could not be executed at all.
    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A worktree exists at the expected path but holds a different branch.
    #[error("worktree exists with unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Git produced output this module could not interpret.
    #[error("failed to parse worktree list output: {0}")]
    Parse(String),
}

/// Outcome of cherry-picking one branch onto another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickResult {
    /// All commits applied cleanly.
    Applied,
    /// A conflict occurred; the cherry-pick was aborted.
    Conflict { details: String },
}

/// One checkout known to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Git plumbing for one repository.
#[derive(Debug)]
pub struct GitRepo {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    /// One mutation at a time against the shared object store.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for GitRepo {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl GitRepo {
    /// Open a repository.
    ///
    /// `worktree_base` is where checkouts are created; by default a
    /// sibling directory of the repository named
    /// `<repo-name>-ensemble-worktrees`. Fails if `repo_path` is not
    /// inside a git work tree.
    pub fn open(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, GitError> {
        let repo_path = repo_path.into();

        let probe = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&repo_path)
            .output();
        let is_repo = matches!(&probe, Ok(out) if out.status.success());
        if !is_repo {
            return Err(GitError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let name = repo_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "repo".to_string());
            repo_path
                .parent()
                .unwrap_or(&repo_path)
                .join(format!("{name}-ensemble-worktrees"))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Conventional branch name: `<prefix>/<session-short-id>/<role>`.
    ///
    /// `role` is a task id, `implementer`, `attempt-0`, `group-1`, etc.
    /// Branch names are globally unique per session because short ids are.
    pub fn branch_name(prefix: &str, short_id: &str, role: &str) -> String {
        format!("{prefix}/{short_id}/{role}")
    }

    /// The directory a branch's worktree lives in.
    fn worktree_path_for(&self, branch: &str) -> PathBuf {
        self.worktree_base.join(branch.replace('/', "--"))
    }

    /// Run a git command and return stdout on success.
    fn run(&self, args: &[&str], cwd: &Path) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| GitError::Command {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// The branch checked out at `path`, or `None` for a detached HEAD.
    /// Errors when `path` is not a git checkout at all.
    fn branch_at(&self, path: &Path) -> Result<Option<String>, GitError> {
        let stdout = self.run(&["branch", "--show-current"], path)?;
        let name = stdout.trim();
        Ok(if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        })
    }

    /// Build a [`WorktreeEntry`] by interrogating the checkout directly.
    fn entry_at(&self, path: &Path, branch: Option<String>) -> Result<WorktreeEntry, GitError> {
        let head = self.run(&["rev-parse", "HEAD"], path)?.trim().to_string();
        Ok(WorktreeEntry {
            path: path.to_path_buf(),
            branch,
            head_commit: head,
        })
    }

    /// Create (or reuse) the worktree for `branch`, rooting the branch on
    /// `base` when it does not exist yet.
    ///
    /// Because directory and branch are tied by convention, an existing
    /// directory holding `branch` is simply handed back -- a retried task
    /// resumes in the same checkout. A directory holding some *other*
    /// branch means two sessions collided on a name and is an error; a
    /// directory that is not a usable checkout (a crashed half-creation)
    /// is cleared and recreated.
    pub fn create_worktree(
        &self,
        branch: &str,
        base: Option<&str>,
    ) -> Result<WorktreeEntry, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.worktree_path_for(branch);

        if path.exists() {
            match self.branch_at(&path) {
                Ok(Some(found)) if found == branch => {
                    tracing::debug!(path = %path.display(), branch, "reusing existing worktree");
                    return self.entry_at(&path, Some(found));
                }
                Ok(Some(found)) => {
                    return Err(GitError::BranchMismatch {
                        expected: branch.to_string(),
                        found,
                    });
                }
                Ok(None) => {
                    tracing::debug!(path = %path.display(), "reusing detached worktree");
                    return self.entry_at(&path, None);
                }
                Err(_) => {
                    // Not a checkout: leftover from a failed creation.
                    tracing::warn!(
                        path = %path.display(),
                        "clearing unusable directory before recreating worktree"
                    );
                    let _ = std::fs::remove_dir_all(&path);
                }
            }
        }

        std::fs::create_dir_all(&self.worktree_base).map_err(|e| GitError::Command {
            message: format!(
                "failed to create worktree base {}",
                self.worktree_base.display()
            ),
            source: e,
        })?;

        self.add_worktree(branch, base, &path)
    }

    /// Run `git worktree add`, self-healing stale registrations first.
    fn add_worktree(
        &self,
        branch: &str,
        base: Option<&str>,
        path: &Path,
    ) -> Result<WorktreeEntry, GitError> {
        // A crash can leave the path registered but gone; prune so the
        // add below starts from a clean slate.
        let _ = self.run(&["worktree", "prune"], &self.repo_path);

        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "add"];
        if self.branch_exists_locked(branch)? {
            args.extend([path_str.as_str(), branch]);
        } else {
            args.extend(["-b", branch, path_str.as_str()]);
            if let Some(base) = base {
                args.push(base);
            }
        }

        if let Err(e) = self.run(&args, &self.repo_path) {
            // Leave nothing half-made behind.
            let _ = std::fs::remove_dir_all(path);
            let _ = self.run(&["worktree", "prune"], &self.repo_path);
            return Err(e);
        }

        self.entry_at(path, Some(branch.to_string()))
    }

    /// Remove a worktree by path. Idempotent: removing a path that holds
    /// no registered worktree only cleans up whatever is left of it.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path_str = path.to_string_lossy().to_string();
        let removal = self.run(
            &["worktree", "remove", "--force", &path_str],
            &self.repo_path,
        );
        let Err(removal_err) = removal else {
            return Ok(());
        };

        // Git refuses when nothing is registered at the path; confirm
        // that is the situation before swallowing the error.
        let registered = self
            .list_worktrees()?
            .into_iter()
            .any(|entry| same_path(&entry.path, path));
        if registered {
            return Err(removal_err);
        }

        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "removing unregistered worktree directory"
            );
            std::fs::remove_dir_all(path).map_err(|e| GitError::Command {
                message: format!("failed to remove directory {}", path.display()),
                source: e,
            })?;
        }
        let _ = self.run(&["worktree", "prune"], &self.repo_path);
        Ok(())
    }

    /// List all worktrees of the repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let stdout = self.run(&["worktree", "list", "--porcelain"], &self.repo_path)?;
        parse_worktree_list(&stdout)
    }

    /// Prune stale worktree registrations.
    pub fn prune_worktrees(&self) -> Result<(), GitError> {
        self.run(&["worktree", "prune"], &self.repo_path)?;
        Ok(())
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.branch_exists_locked(branch)
    }

    fn branch_exists_locked(&self, branch: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{branch}");
        let output = Command::new("git")
            .args(["rev-parse", "--verify", &refname])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    /// Delete a local branch with `-D`. Idempotent: a branch that does
    /// not exist needs no deleting.
    pub fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.branch_exists_locked(branch)? {
            return Ok(());
        }
        self.run(&["branch", "-D", branch], &self.repo_path)?;
        Ok(())
    }

    /// Count commits reachable from `head` but not from `base`
    /// (`git rev-list --count base..head`).
    pub fn count_commits_between(&self, base: &str, head: &str) -> Result<u32, GitError> {
        let range = format!("{base}..{head}");
        let stdout = self.run(&["rev-list", "--count", &range], &self.repo_path)?;
        stdout
            .trim()
            .parse::<u32>()
            .map_err(|e| GitError::Parse(format!("rev-list --count output {stdout:?}: {e}")))
    }

    /// Cherry-pick all commits of `base..head` into the checkout at
    /// `worktree_path`.
    ///
    /// On conflict the cherry-pick is aborted and
    /// [`CherryPickResult::Conflict`] is returned; the worktree is left
    /// clean for the caller to fail the consolidation.
    pub fn cherry_pick_range(
        &self,
        worktree_path: &Path,
        base: &str,
        head: &str,
    ) -> Result<CherryPickResult, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let range = format!("{base}..{head}");
        match self.run(&["cherry-pick", &range], worktree_path) {
            Ok(_) => Ok(CherryPickResult::Applied),
            Err(GitError::Exit { stderr, code, command }) => {
                let conflicted = stderr.contains("conflict")
                    || stderr.contains("CONFLICT")
                    || stderr.contains("could not apply");
                if conflicted {
                    let _ = self.run(&["cherry-pick", "--abort"], worktree_path);
                    return Ok(CherryPickResult::Conflict {
                        details: stderr.trim().to_string(),
                    });
                }
                Err(GitError::Exit {
                    stderr,
                    code,
                    command,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Push a branch to `origin`. Callers treat failure as a warning.
    pub fn push_branch(&self, branch: &str) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let refspec = format!("{branch}:{branch}");
        self.run(&["push", "origin", &refspec], &self.repo_path)?;
        Ok(())
    }

    /// Resolve the repository's current branch name.
    pub fn current_branch(&self) -> Result<String, GitError> {
        let stdout = self.run(&["branch", "--show-current"], &self.repo_path)?;
        Ok(stdout.trim().to_string())
    }
}

/// Path equality that survives symlinked temp directories: canonical
/// forms when both resolve, raw comparison otherwise.
fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Parse `git worktree list --porcelain` output.
///
/// Entries are blank-line separated key/value blocks:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// Bare and detached checkouts carry a marker line instead of `branch`.
/// An entry missing its path or HEAD is a parse error rather than being
/// silently dropped.
fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeEntry>, GitError> {
    let mut entries = Vec::new();

    for block in output.split("\n\n") {
        let mut path: Option<PathBuf> = None;
        let mut head: Option<String> = None;
        let mut branch: Option<String> = None;

        for line in block.lines() {
            match line.split_once(' ') {
                Some(("worktree", rest)) => path = Some(PathBuf::from(rest)),
                Some(("HEAD", rest)) => head = Some(rest.to_string()),
                Some(("branch", rest)) => {
                    branch = Some(
                        rest.strip_prefix("refs/heads/")
                            .unwrap_or(rest)
                            .to_string(),
                    );
                }
                // `bare`, `detached`, `prunable` and friends carry no
                // payload this module uses.
                _ => {}
            }
        }

        match (path, head) {
            (Some(path), Some(head)) => entries.push(WorktreeEntry {
                path,
                branch,
                head_commit: head,
            }),
            (None, None) => {} // blank block between entries or at the end
            (Some(path), None) => {
                return Err(GitError::Parse(format!(
                    "worktree entry for {} has no HEAD line",
                    path.display()
                )));
            }
            (None, Some(_)) => {
                return Err(GitError::Parse(
                    "HEAD line outside a worktree entry".to_string(),
                ));
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temporary git repository with one commit on `main`.
    fn temp_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let repo = dir.path().to_path_buf();

        let run = |args: &[&str], cwd: &Path| {
            let output = Command::new("git")
                .args(args)
                .current_dir(cwd)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "--initial-branch=main"], &repo);
        run(&["config", "user.email", "test@ensemble.dev"], &repo);
        run(&["config", "user.name", "Ensemble Test"], &repo);
        std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."], &repo);
        run(&["commit", "-m", "initial commit"], &repo);

        (dir, repo)
    }

    fn commit_file(worktree: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(worktree.join(name), content).unwrap();
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(worktree)
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };
        run(&["add", name]);
        run(&["commit", "-m", message]);
    }

    #[test]
    fn open_rejects_non_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = GitRepo::open(dir.path(), None);
        assert!(matches!(result, Err(GitError::NotAGitRepo(_))));
    }

    #[test]
    fn open_rejects_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = GitRepo::open(dir.path().join("nowhere"), None);
        assert!(matches!(result, Err(GitError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(
            GitRepo::branch_name("ensemble", "ab12cd34", "task-auth"),
            "ensemble/ab12cd34/task-auth"
        );
    }

    #[test]
    fn create_worktree_from_base_branch() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git
            .create_worktree("ensemble/s1/task-a", Some("main"))
            .expect("create worktree");
        assert!(entry.path.exists());
        assert_eq!(entry.branch.as_deref(), Some("ensemble/s1/task-a"));
        assert!(!entry.head_commit.is_empty());
        assert!(entry.path.join("README.md").exists());
    }

    #[test]
    fn create_worktree_is_idempotent() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let first = git.create_worktree("ensemble/s1/task-b", Some("main")).unwrap();
        let second = git.create_worktree("ensemble/s1/task-b", Some("main")).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
    }

    #[test]
    fn create_worktree_recovers_from_stale_directory() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        // Plant a plain directory where the worktree should go, as a
        // crashed half-creation would.
        let stale = base_dir.path().join("ensemble--s1--task-s");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk.txt"), "leftover\n").unwrap();

        let entry = git
            .create_worktree("ensemble/s1/task-s", Some("main"))
            .expect("create over stale directory");
        assert_eq!(entry.branch.as_deref(), Some("ensemble/s1/task-s"));
        assert!(entry.path.join("README.md").exists());
        assert!(!entry.path.join("junk.txt").exists());
    }

    #[test]
    fn remove_worktree_is_idempotent() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git.create_worktree("ensemble/s1/task-c", Some("main")).unwrap();
        git.remove_worktree(&entry.path).unwrap();
        assert!(!entry.path.exists());
        git.remove_worktree(&entry.path).unwrap();
    }

    #[test]
    fn remove_worktree_clears_unregistered_directory() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let stray = base_dir.path().join("never-a-worktree");
        std::fs::create_dir_all(&stray).unwrap();
        git.remove_worktree(&stray).unwrap();
        assert!(!stray.exists());
    }

    #[test]
    fn count_commits_between_base_and_head() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git.create_worktree("ensemble/s1/task-d", Some("main")).unwrap();
        assert_eq!(
            git.count_commits_between("main", "ensemble/s1/task-d").unwrap(),
            0
        );

        commit_file(&entry.path, "one.txt", "1\n", "first");
        commit_file(&entry.path, "two.txt", "2\n", "second");
        assert_eq!(
            git.count_commits_between("main", "ensemble/s1/task-d").unwrap(),
            2
        );
    }

    #[test]
    fn cherry_pick_applies_clean_commits() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        // A task branch with one commit.
        let task = git.create_worktree("ensemble/s1/task-e", Some("main")).unwrap();
        commit_file(&task.path, "feature.txt", "feature\n", "add feature");

        // A consolidation branch rooted on main.
        let consolidated = git
            .create_worktree("ensemble/s1/group-1", Some("main"))
            .unwrap();

        let result = git
            .cherry_pick_range(&consolidated.path, "main", "ensemble/s1/task-e")
            .unwrap();
        assert_eq!(result, CherryPickResult::Applied);
        assert!(consolidated.path.join("feature.txt").exists());
        assert_eq!(
            git.count_commits_between("main", "ensemble/s1/group-1").unwrap(),
            1
        );
    }

    #[test]
    fn cherry_pick_conflict_is_aborted() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        // Two branches editing the same file differently.
        let a = git.create_worktree("ensemble/s1/task-f", Some("main")).unwrap();
        commit_file(&a.path, "shared.txt", "version A\n", "task f version");

        let b = git.create_worktree("ensemble/s1/task-g", Some("main")).unwrap();
        commit_file(&b.path, "shared.txt", "version B\n", "task g version");

        let consolidated = git
            .create_worktree("ensemble/s1/group-1c", Some("main"))
            .unwrap();
        let first = git
            .cherry_pick_range(&consolidated.path, "main", "ensemble/s1/task-f")
            .unwrap();
        assert_eq!(first, CherryPickResult::Applied);

        let second = git
            .cherry_pick_range(&consolidated.path, "main", "ensemble/s1/task-g")
            .unwrap();
        assert!(
            matches!(second, CherryPickResult::Conflict { .. }),
            "expected conflict, got {second:?}"
        );

        // The abort must leave the worktree clean: no cherry-pick in
        // progress, content still version A.
        let content = std::fs::read_to_string(consolidated.path.join("shared.txt")).unwrap();
        assert_eq!(content, "version A\n");
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git.create_worktree("ensemble/s1/task-h", Some("main")).unwrap();
        git.remove_worktree(&entry.path).unwrap();

        assert!(git.branch_exists("ensemble/s1/task-h").unwrap());
        git.delete_branch("ensemble/s1/task-h").unwrap();
        assert!(!git.branch_exists("ensemble/s1/task-h").unwrap());
        git.delete_branch("ensemble/s1/task-h").unwrap();
    }

    #[test]
    fn list_worktrees_reports_created_checkouts() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        git.create_worktree("ensemble/s1/task-l", Some("main")).unwrap();
        let entries = git.list_worktrees().unwrap();
        // The main checkout plus the one just created.
        assert!(entries.len() >= 2);
        assert!(
            entries
                .iter()
                .any(|e| e.branch.as_deref() == Some("ensemble/s1/task-l"))
        );
    }

    #[test]
    fn prune_drops_stale_registrations() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git.create_worktree("ensemble/s1/task-p", Some("main")).unwrap();
        // Simulate an externally deleted checkout.
        std::fs::remove_dir_all(&entry.path).unwrap();

        git.prune_worktrees().unwrap();
        let entries = git.list_worktrees().unwrap();
        assert!(
            !entries
                .iter()
                .any(|e| e.branch.as_deref() == Some("ensemble/s1/task-p")),
            "pruned worktree should no longer be listed"
        );
    }

    #[test]
    fn parse_worktree_list_output() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/ensemble/s1/task-a

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let entries = parse_worktree_list(input).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("ensemble/s1/task-a"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn parse_worktree_list_without_trailing_newline() {
        let input = "worktree /p\nHEAD abc\nbranch refs/heads/main";
        let entries = parse_worktree_list(input).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_worktree_list_rejects_entry_without_head() {
        let input = "worktree /p\nbranch refs/heads/main\n\n";
        assert!(matches!(
            parse_worktree_list(input),
            Err(GitError::Parse(_))
        ));
    }

    #[test]
    fn parse_worktree_list_empty_output() {
        assert!(parse_worktree_list("").unwrap().is_empty());
    }

    #[test]
    fn worktree_isolation_from_main_repo() {
        let (_dir, repo) = temp_repo();
        let base_dir = tempfile::TempDir::new().unwrap();
        let git = GitRepo::open(&repo, Some(base_dir.path().to_path_buf())).unwrap();

        let entry = git.create_worktree("ensemble/s1/task-i", Some("main")).unwrap();
        std::fs::write(entry.path.join("agent-output.txt"), "work\n").unwrap();
        assert!(!repo.join("agent-output.txt").exists());
    }
}
