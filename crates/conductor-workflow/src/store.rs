//! Durable run and approval state
//!
//! The state store is the single source of truth for recovery: every step
//! transition is written here before the engine acts on it.

use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::run::{RunStatus, WorkflowRun};
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Run and approval repository
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new run. Fails if the id is already taken.
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Checkpoint an existing run
    async fn save_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Runs ordered by creation time, optionally filtered by status
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<WorkflowRun>>;

    /// Runs that have not reached a terminal status
    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>> {
        Ok(self
            .list_runs(None)
            .await?
            .into_iter()
            .filter(|run| !run.is_terminal())
            .collect())
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()>;

    async fn load_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>>;

    async fn approvals_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRequest>>;

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>>;
}

/// In-memory state store, for tests and single-process deployments
pub struct InMemoryStateStore {
    runs: RwLock<HashMap<String, WorkflowRun>>,
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            approvals: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(WorkflowError::Storage(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut result: Vec<WorkflowRun> = runs
            .values()
            .filter(|run| status.map_or(true, |s| run.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()> {
        self.approvals
            .write()
            .await
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn load_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.approvals.read().await.get(request_id).cloned())
    }

    async fn approvals_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRequest>> {
        let approvals = self.approvals.read().await;
        let mut result: Vec<ApprovalRequest> = approvals
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let approvals = self.approvals.read().await;
        let mut result: Vec<ApprovalRequest> = approvals
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }
}
