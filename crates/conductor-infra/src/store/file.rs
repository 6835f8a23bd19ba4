//! JSON-file state store
//!
//! One file per run under `runs/` and one per approval request under
//! `approvals/`. Every write goes to a temporary file that is renamed over the
//! target, so readers never observe a partially written checkpoint.

use crate::{InfraError, Result};
use async_trait::async_trait;
use conductor_workflow::{
    ApprovalRequest, ApprovalStatus, RunStatus, StateStore, WorkflowError, WorkflowRun,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const RUNS: &str = "runs";
const APPROVALS: &str = "approvals";

pub struct FileStateStore {
    base_dir: PathBuf,
    create_lock: Mutex<()>,
}

impl FileStateStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        info!(path = %base_dir.display(), "Initializing file state store");

        for domain in [RUNS, APPROVALS] {
            fs::create_dir_all(base_dir.join(domain)).await?;
        }

        Ok(Self {
            base_dir,
            create_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn get_path(&self, domain: &str, id: &str) -> PathBuf {
        self.base_dir.join(domain).join(format!("{}.json", sanitize(id)))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file and rename into place
    async fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(data)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| InfraError::Configuration(format!("bad state path {}", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, domain: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = fs::read_dir(self.base_dir.join(domain)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
            if !is_record {
                continue;
            }

            match self.read_json(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable state file"),
            }
        }

        Ok(items)
    }
}

/// Keep ids from escaping the store directory
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> conductor_workflow::Result<()> {
        let _guard = self.create_lock.lock().await;
        let path = self.get_path(RUNS, &run.run_id);

        if fs::try_exists(&path).await.map_err(InfraError::from)? {
            return Err(WorkflowError::Storage(format!("run {} already exists", run.run_id)));
        }

        self.write_json(&path, run).await?;
        debug!(run_id = %run.run_id, "Run created");
        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> conductor_workflow::Result<()> {
        let path = self.get_path(RUNS, &run.run_id);
        self.write_json(&path, run).await?;
        debug!(run_id = %run.run_id, revision = run.revision, status = %run.status, "Run checkpointed");
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> conductor_workflow::Result<Option<WorkflowRun>> {
        Ok(self.read_json(&self.get_path(RUNS, run_id)).await?)
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> conductor_workflow::Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .read_all::<WorkflowRun>(RUNS)
            .await?
            .into_iter()
            .filter(|run| status.map_or(true, |s| run.status == s))
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> conductor_workflow::Result<()> {
        let path = self.get_path(APPROVALS, &request.request_id);
        self.write_json(&path, request).await?;
        Ok(())
    }

    async fn load_approval(&self, request_id: &str) -> conductor_workflow::Result<Option<ApprovalRequest>> {
        Ok(self.read_json(&self.get_path(APPROVALS, request_id)).await?)
    }

    async fn approvals_for_run(&self, run_id: &str) -> conductor_workflow::Result<Vec<ApprovalRequest>> {
        let mut requests: Vec<ApprovalRequest> = self
            .read_all::<ApprovalRequest>(APPROVALS)
            .await?
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> conductor_workflow::Result<Vec<ApprovalRequest>> {
        let mut requests: Vec<ApprovalRequest> = self
            .read_all::<ApprovalRequest>(APPROVALS)
            .await?
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }
}
