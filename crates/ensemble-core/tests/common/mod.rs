//! Shared test support: temp git repos and a scripted fake broker.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use ensemble_core::broker::{InstanceBroker, InstanceHandle, InstanceSpec, InstanceStatus};
use ensemble_core::git::GitRepo;

/// Create a temporary git repository with one commit on `main`.
pub fn temp_repo() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let repo = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let out = Command::new("git")
            .args(args)
            .current_dir(&repo)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            out.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr)
        );
    };

    run(&["init", "--initial-branch=main"]);
    run(&["config", "user.email", "test@ensemble.dev"]);
    run(&["config", "user.name", "Ensemble Test"]);
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial commit"]);

    (dir, repo)
}

/// One scripted activation of a fake agent: what it does after being
/// started (or re-prompted), and the status it settles into.
#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    /// Files to commit in the worktree, in order.
    pub commit_files: Vec<(String, String)>,
    /// Sentinel file to write after the commits: (filename, body).
    pub sentinel: Option<(String, String)>,
    /// Text appended to the instance output.
    pub output: String,
    /// Status the instance settles into once the script ran.
    pub final_status: InstanceStatus,
}

impl Script {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            commit_files: Vec::new(),
            sentinel: None,
            output: String::new(),
            final_status: InstanceStatus::Completed,
        }
    }

    pub fn commit(mut self, name: &str, content: &str) -> Self {
        self.commit_files.push((name.to_string(), content.to_string()));
        self
    }

    pub fn sentinel(mut self, filename: &str, body: impl Into<String>) -> Self {
        self.sentinel = Some((filename.to_string(), body.into()));
        self
    }

    pub fn output(mut self, text: &str) -> Self {
        self.output = text.to_string();
        self
    }

    pub fn settle(mut self, status: InstanceStatus) -> Self {
        self.final_status = status;
        self
    }
}

struct FakeInstance {
    handle: InstanceHandle,
    role: String,
    status: Arc<StdMutex<InstanceStatus>>,
    output: Arc<StdMutex<Vec<u8>>>,
}

/// A broker whose agents follow pre-registered scripts per role. Each
/// `start` (and each `send_input`) consumes the next script for the
/// instance's role; a role with no scripts left just keeps working.
pub struct FakeBroker {
    git: GitRepo,
    prefix: String,
    scripts: StdMutex<HashMap<String, VecDeque<Script>>>,
    instances: Mutex<HashMap<Uuid, FakeInstance>>,
}

impl FakeBroker {
    pub fn new(git: GitRepo) -> Self {
        Self {
            git,
            prefix: "ensemble".to_string(),
            scripts: StdMutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a script for the next activation of `role`.
    pub fn script(&self, role: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(role.to_string())
            .or_default()
            .push_back(script);
    }

    fn pop_script(&self, role: &str) -> Option<Script> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(role)
            .and_then(|q| q.pop_front())
    }

    fn run_script(
        script: Script,
        worktree: PathBuf,
        status: Arc<StdMutex<InstanceStatus>>,
        output: Arc<StdMutex<Vec<u8>>>,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep(script.delay).await;

            for (name, content) in &script.commit_files {
                std::fs::write(worktree.join(name), content).expect("script write");
                let run = |args: &[&str]| {
                    let out = Command::new("git")
                        .args(args)
                        .current_dir(&worktree)
                        .output()
                        .expect("script git");
                    assert!(
                        out.status.success(),
                        "script git {} failed: {}",
                        args.join(" "),
                        String::from_utf8_lossy(&out.stderr)
                    );
                };
                run(&["add", name]);
                run(&["commit", "-m", &format!("scripted: {name}")]);
            }

            if let Some((filename, body)) = &script.sentinel {
                std::fs::write(worktree.join(filename), body).expect("sentinel write");
            }

            if !script.output.is_empty() {
                output.lock().unwrap().extend_from_slice(script.output.as_bytes());
            }

            *status.lock().unwrap() = script.final_status;
        });
    }

    async fn register(&self, handle: InstanceHandle, role: String) -> InstanceHandle {
        let instance = FakeInstance {
            handle: handle.clone(),
            role,
            status: Arc::new(StdMutex::new(InstanceStatus::Pending)),
            output: Arc::new(StdMutex::new(Vec::new())),
        };
        self.instances.lock().await.insert(handle.id, instance);
        handle
    }

    async fn activate(&self, id: Uuid) -> Result<()> {
        let (role, worktree, status, output) = {
            let instances = self.instances.lock().await;
            let inst = instances.get(&id).context("unknown instance")?;
            (
                inst.role.clone(),
                inst.handle.worktree.clone(),
                Arc::clone(&inst.status),
                Arc::clone(&inst.output),
            )
        };

        *status.lock().unwrap() = InstanceStatus::Working;
        match self.pop_script(&role) {
            Some(script) => Self::run_script(script, worktree, status, output),
            None => {
                // No script: the agent just keeps working (hangs).
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceBroker for FakeBroker {
    async fn create(&self, spec: InstanceSpec) -> Result<InstanceHandle> {
        self.create_from_branch(spec, "main").await
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
        Ok(self.register(handle, spec.role).await)
    }

    async fn create_from_branch(
        &self,
        spec: InstanceSpec,
        base_branch: &str,
    ) -> Result<InstanceHandle> {
        let branch = GitRepo::branch_name(&self.prefix, &spec.session_short_id, &spec.role);
        let entry = self.git.create_worktree(&branch, Some(base_branch))?;
        let handle = InstanceHandle {
            id: Uuid::new_v4(),
            worktree: entry.path,
            branch,
        };
        Ok(self.register(handle, spec.role).await)
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        self.activate(id).await
    }

    async fn stop(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn status(&self, id: Uuid) -> Result<InstanceStatus> {
        let instances = self.instances.lock().await;
        let inst = instances.get(&id).context("unknown instance")?;
        let status = *inst.status.lock().unwrap();
        Ok(status)
    }

    async fn output(&self, id: Uuid) -> Result<Vec<u8>> {
        let instances = self.instances.lock().await;
        let inst = instances.get(&id).context("unknown instance")?;
        let output = inst.output.lock().unwrap().clone();
        Ok(output)
    }

    async fn send_input(&self, id: Uuid, _bytes: &[u8]) -> Result<()> {
        {
            let instances = self.instances.lock().await;
            if !instances.contains_key(&id) {
                bail!("unknown instance {id}");
            }
        }
        self.activate(id).await
    }

    async fn get(&self, id: Uuid) -> Option<InstanceHandle> {
        self.instances.lock().await.get(&id).map(|i| i.handle.clone())
    }
}

/// JSON body for a `task-complete.json` sentinel.
pub fn task_complete_body(task_id: &str) -> String {
    format!(
        r#"{{"task_id": "{task_id}", "status": "complete", "summary": "done", "files_modified": []}}"#
    )
}
