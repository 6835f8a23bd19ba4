//! Redis-backed state store
//!
//! Runs live at `{prefix}run:{id}` and are indexed in the `{prefix}runs`
//! sorted set by creation time. Approval requests live at
//! `{prefix}approval:{id}`, indexed per run and globally.

use crate::connection::RedisConfig;
use crate::Result;
use async_trait::async_trait;
use conductor_workflow::{
    ApprovalRequest, ApprovalStatus, RunStatus, StateStore, WorkflowError, WorkflowRun,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RedisStateStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisStateStore {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let connection = config.connect().await?;
        Ok(Self { connection, config })
    }

    fn run_key(&self, run_id: &str) -> String {
        self.config.key("run", run_id)
    }

    fn run_index(&self) -> String {
        format!("{}runs", self.config.key_prefix)
    }

    fn approval_key(&self, request_id: &str) -> String {
        self.config.key("approval", request_id)
    }

    fn run_approvals_key(&self, run_id: &str) -> String {
        self.config.key("approvals", run_id)
    }

    fn approval_index(&self) -> String {
        format!("{}approvals", self.config.key_prefix)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    async fn load_many<T: DeserializeOwned>(&self, keys: Vec<String>) -> Result<Vec<T>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_json(&key).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => debug!(key = %key, "Indexed record is gone"),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(items)
    }

    async fn approvals_in(&self, set_key: &str) -> Result<Vec<ApprovalRequest>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(set_key).await?;
        let keys = ids.iter().map(|id| self.approval_key(id)).collect();

        let mut requests: Vec<ApprovalRequest> = self.load_many(keys).await?;
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> conductor_workflow::Result<()> {
        let body = serde_json::to_string(run)?;
        let mut conn = self.connection.clone();

        let created: Option<String> = redis::cmd("SET")
            .arg(self.run_key(&run.run_id))
            .arg(body)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(crate::InfraError::from)?;
        if created.is_none() {
            return Err(WorkflowError::Storage(format!("run {} already exists", run.run_id)));
        }

        let _: () = conn
            .zadd(self.run_index(), &run.run_id, run.created_at.timestamp_millis())
            .await
            .map_err(crate::InfraError::from)?;
        debug!(run_id = %run.run_id, "Run created");
        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> conductor_workflow::Result<()> {
        let body = serde_json::to_string(run)?;
        let mut conn = self.connection.clone();
        let _: () = conn
            .set(self.run_key(&run.run_id), body)
            .await
            .map_err(crate::InfraError::from)?;
        debug!(run_id = %run.run_id, revision = run.revision, status = %run.status, "Run checkpointed");
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> conductor_workflow::Result<Option<WorkflowRun>> {
        Ok(self.get_json(&self.run_key(run_id)).await?)
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> conductor_workflow::Result<Vec<WorkflowRun>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrange(self.run_index(), 0, -1)
            .await
            .map_err(crate::InfraError::from)?;
        let keys = ids.iter().map(|id| self.run_key(id)).collect();

        let runs: Vec<WorkflowRun> = self.load_many(keys).await?;
        Ok(runs
            .into_iter()
            .filter(|run| status.map_or(true, |s| run.status == s))
            .collect())
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> conductor_workflow::Result<()> {
        let body = serde_json::to_string(request)?;
        let mut conn = self.connection.clone();

        let _: () = redis::pipe()
            .atomic()
            .set(self.approval_key(&request.request_id), body)
            .ignore()
            .sadd(self.run_approvals_key(&request.run_id), &request.request_id)
            .ignore()
            .sadd(self.approval_index(), &request.request_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(crate::InfraError::from)?;
        Ok(())
    }

    async fn load_approval(&self, request_id: &str) -> conductor_workflow::Result<Option<ApprovalRequest>> {
        Ok(self.get_json(&self.approval_key(request_id)).await?)
    }

    async fn approvals_for_run(&self, run_id: &str) -> conductor_workflow::Result<Vec<ApprovalRequest>> {
        Ok(self.approvals_in(&self.run_approvals_key(run_id)).await?)
    }

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> conductor_workflow::Result<Vec<ApprovalRequest>> {
        Ok(self
            .approvals_in(&self.approval_index())
            .await?
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_workflow::{StepDefinition, WorkflowTemplate};
    use serde_json::Map;

    // Needs a live server: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
    async fn store() -> RedisStateStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("conductor-test-{}:", uuid::Uuid::new_v4());
        RedisStateStore::new(RedisConfig::new(url).with_key_prefix(Some(prefix)))
            .await
            .expect("redis should be reachable")
    }

    #[tokio::test]
    #[ignore]
    async fn test_run_round_trip() {
        let store = store().await;
        let template = WorkflowTemplate::new("deploy").with_step(StepDefinition::agent("a", "x"));
        let mut run = WorkflowRun::new(&template, Map::new());

        store.create_run(&run).await.unwrap();
        assert!(store.create_run(&run).await.is_err());

        run.complete();
        store.save_run(&run).await.unwrap();

        let loaded = store.load_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(store.list_runs(Some(RunStatus::Completed)).await.unwrap().len(), 1);
        assert!(store.list_active_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_approval_indexes() {
        let store = store().await;
        let expires = chrono::Utc::now() + chrono::Duration::hours(1);
        let request = ApprovalRequest::new("run-1", "gate", "Ship?", Default::default(), expires);

        store.save_approval(&request).await.unwrap();
        store.save_approval(&request.clone().filed("t-1")).await.unwrap();

        let for_run = store.approvals_for_run("run-1").await.unwrap();
        assert_eq!(for_run.len(), 1);
        assert_eq!(for_run[0].status, ApprovalStatus::Pending);
        assert_eq!(store.list_approvals(Some(ApprovalStatus::Pending)).await.unwrap().len(), 1);
    }
}
