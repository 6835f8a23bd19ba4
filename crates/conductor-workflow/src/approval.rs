//! Approval gate implementation for workflow steps
//!
//! An approval gate opens a request, files a ticket with the external
//! approval system and suspends the step. The run stays suspended until a
//! resume call carries a verdict or the request expires.

use crate::clients::ApprovalClient;
use crate::decision::RiskLevel;
use crate::executor::{bounded, StepContext, StepError, StepExecutor, StepOutcome};
use crate::render::render_str;
use crate::run::WaitReason;
use crate::store::StateStore;
use crate::template::{StepDefinition, StepKind};
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Status of an approval request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Recorded locally, ticket not yet filed
    Created,
    /// Ticket filed, awaiting a verdict
    Pending,
    Approved,
    Rejected,
    /// Verdict did not arrive before `expires_at`
    Expired,
    /// The run was cancelled while waiting
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ApprovalStatus::Created | ApprovalStatus::Pending)
    }
}

/// Approval request information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub run_id: String,
    pub step_id: String,
    pub status: ApprovalStatus,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Ticket id in the external approval system
    #[serde(default)]
    pub external_ref: Option<String>,
    /// Payload received with the verdict
    #[serde(default)]
    pub response: Option<Value>,
}

impl ApprovalRequest {
    /// Create a new approval request
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        summary: impl Into<String>,
        risk_level: RiskLevel,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            status: ApprovalStatus::Created,
            summary: summary.into(),
            risk_level,
            created_at: Utc::now(),
            expires_at,
            resolved_at: None,
            external_ref: None,
            response: None,
        }
    }

    /// Check if an open request has passed its deadline
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && now >= self.expires_at
    }

    /// Record the filed ticket
    pub fn filed(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self.status = ApprovalStatus::Pending;
        self
    }

    /// Apply a verdict
    pub fn resolve(mut self, verdict: ApprovalVerdict, response: Value) -> Self {
        self.status = match verdict {
            ApprovalVerdict::Approved => ApprovalStatus::Approved,
            ApprovalVerdict::Rejected => ApprovalStatus::Rejected,
        };
        self.response = Some(response);
        self.resolved_at = Some(Utc::now());
        self
    }

    /// Mark as expired
    pub fn expire(mut self) -> Self {
        self.status = ApprovalStatus::Expired;
        self.resolved_at = Some(Utc::now());
        self
    }

    /// Cancel the request
    pub fn cancel(mut self) -> Self {
        self.status = ApprovalStatus::Cancelled;
        self.resolved_at = Some(Utc::now());
        self
    }
}

/// Verdict carried by a resume payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerdict {
    Approved,
    Rejected,
}

impl ApprovalVerdict {
    /// Read `approved: bool` or `decision: "approved" | "rejected"`
    pub fn from_payload(payload: &Value) -> Result<Self> {
        if let Some(approved) = payload.get("approved").and_then(Value::as_bool) {
            return Ok(if approved {
                ApprovalVerdict::Approved
            } else {
                ApprovalVerdict::Rejected
            });
        }

        match payload
            .get("decision")
            .and_then(Value::as_str)
            .map(|d| d.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("approved") | Some("approve") => Ok(ApprovalVerdict::Approved),
            Some("rejected") | Some("reject") | Some("denied") => Ok(ApprovalVerdict::Rejected),
            Some(other) => Err(WorkflowError::Validation(format!(
                "unknown approval decision `{}`",
                other
            ))),
            None => Err(WorkflowError::Validation(
                "resume payload carries no `approved` or `decision` field".to_string(),
            )),
        }
    }
}

/// Executes approval gates
pub struct ApprovalGateExecutor {
    store: Arc<dyn StateStore>,
    client: Arc<dyn ApprovalClient>,
    default_expiry: Duration,
}

impl ApprovalGateExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        client: Arc<dyn ApprovalClient>,
        default_expiry: Duration,
    ) -> Self {
        Self {
            store,
            client,
            default_expiry,
        }
    }

    fn summary(step: &StepDefinition, ctx: &StepContext) -> std::result::Result<String, StepError> {
        if let StepKind::ApprovalGate {
            summary: Some(summary),
            ..
        } = &step.kind
        {
            return Ok(render_str(summary, &ctx.context)?);
        }

        Ok(ctx
            .payload
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Approval required for step {} of run {}", step.id, ctx.run_id)))
    }

    fn risk_level(ctx: &StepContext) -> RiskLevel {
        ctx.payload
            .get("risk_level")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    fn expiry(&self, step: &StepDefinition) -> Duration {
        match &step.kind {
            StepKind::ApprovalGate {
                expires_in_seconds: Some(secs),
                ..
            } => Duration::from_secs(*secs),
            _ => self.default_expiry,
        }
    }

    async fn file_ticket(
        &self,
        ctx: &StepContext,
        request: ApprovalRequest,
    ) -> std::result::Result<ApprovalRequest, StepError> {
        let external_ref = bounded(ctx, "approval ticket", async {
            self.client
                .create_ticket(
                    &request.run_id,
                    &request.step_id,
                    &request.summary,
                    request.risk_level,
                )
                .await
                .map_err(StepError::from)
        })
        .await?;

        let request = request.filed(external_ref);
        self.store.save_approval(&request).await?;
        Ok(request)
    }
}

#[async_trait]
impl StepExecutor for ApprovalGateExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> std::result::Result<StepOutcome, StepError> {
        let existing = self
            .store
            .approvals_for_run(&ctx.run_id)
            .await?
            .into_iter()
            .find(|r| r.step_id == step.id && r.status.is_open());

        let request = match existing {
            Some(request) if request.status == ApprovalStatus::Pending => {
                tracing::info!(
                    run_id = %ctx.run_id,
                    step_id = %step.id,
                    request_id = %request.request_id,
                    "Reusing pending approval request"
                );
                request
            }
            Some(request) => self.file_ticket(&ctx, request).await?,
            None => {
                let expiry = chrono::Duration::from_std(self.expiry(step))
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                let request = ApprovalRequest::new(
                    &ctx.run_id,
                    &step.id,
                    Self::summary(step, &ctx)?,
                    Self::risk_level(&ctx),
                    Utc::now() + expiry,
                );
                self.store.save_approval(&request).await?;
                self.file_ticket(&ctx, request).await?
            }
        };

        if ctx.cancel.is_cancelled() {
            // Filed after the run ended; nobody will resolve it
            let request = request.cancel();
            self.store.save_approval(&request).await?;
            tracing::debug!(
                run_id = %ctx.run_id,
                step_id = %step.id,
                request_id = %request.request_id,
                "Approval request withdrawn, run cancelled"
            );
            return Err(StepError::Cancelled);
        }

        tracing::info!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            request_id = %request.request_id,
            external_ref = ?request.external_ref,
            expires_at = %request.expires_at,
            "Approval requested"
        );

        Ok(StepOutcome::Suspended {
            output: None,
            wait: WaitReason::Approval {
                request_id: request.request_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientError, MockApprovalClient};
    use crate::executor::tests::step_context;
    use crate::store::InMemoryStateStore;
    use serde_json::json;

    #[test]
    fn test_verdict_from_payload() {
        assert_eq!(
            ApprovalVerdict::from_payload(&json!({"approved": true})).unwrap(),
            ApprovalVerdict::Approved
        );
        assert_eq!(
            ApprovalVerdict::from_payload(&json!({"approved": false})).unwrap(),
            ApprovalVerdict::Rejected
        );
        assert_eq!(
            ApprovalVerdict::from_payload(&json!({"decision": "Rejected"})).unwrap(),
            ApprovalVerdict::Rejected
        );
        assert!(matches!(
            ApprovalVerdict::from_payload(&json!({"comment": "lgtm"})),
            Err(WorkflowError::Validation(_))
        ));
        assert!(matches!(
            ApprovalVerdict::from_payload(&json!({"decision": "maybe"})),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_request_transitions() {
        let request = ApprovalRequest::new(
            "run-1",
            "gate",
            "ship",
            RiskLevel::High,
            Utc::now() - chrono::Duration::seconds(1),
        );
        assert!(request.is_expired_at(Utc::now()));

        let filed = request.filed("TICKET-1");
        assert_eq!(filed.status, ApprovalStatus::Pending);

        let resolved = filed.resolve(ApprovalVerdict::Approved, json!({"approved": true}));
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(resolved.resolved_at.is_some());
        assert!(!resolved.is_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_gate_files_ticket_and_suspends() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut client = MockApprovalClient::new();
        client
            .expect_create_ticket()
            .withf(|run_id, step_id, summary, risk| {
                run_id == "run-1" && step_id == "gate" && summary == "Deploy to staging" && *risk == RiskLevel::Medium
            })
            .times(1)
            .returning(|_, _, _, _| Ok("TICKET-7".to_string()));

        let executor =
            ApprovalGateExecutor::new(store.clone(), Arc::new(client), Duration::from_secs(60));
        let step = StepDefinition::approval("gate");
        let (ctx, _rx) = step_context(json!({"summary": "Deploy to staging", "risk_level": "medium"}));

        let outcome = executor.execute(&step, ctx).await.unwrap();
        let StepOutcome::Suspended {
            wait: WaitReason::Approval { request_id },
            ..
        } = outcome
        else {
            panic!("expected an approval suspension");
        };

        let request = store.load_approval(&request_id).await.unwrap().unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.external_ref.as_deref(), Some("TICKET-7"));
    }

    #[tokio::test]
    async fn test_replay_reuses_pending_request() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut client = MockApprovalClient::new();
        client
            .expect_create_ticket()
            .times(1)
            .returning(|_, _, _, _| Ok("TICKET-1".to_string()));

        let executor =
            ApprovalGateExecutor::new(store.clone(), Arc::new(client), Duration::from_secs(60));
        let step = StepDefinition::approval("gate");

        let (ctx, _rx) = step_context(json!({}));
        let first = executor.execute(&step, ctx).await.unwrap();
        let (ctx, _rx) = step_context(json!({}));
        let second = executor.execute(&step, ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.approvals_for_run("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ticket_failure_keeps_created_request_for_retry() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut client = MockApprovalClient::new();
        let mut calls = 0;
        client.expect_create_ticket().times(2).returning(move |_, _, _, _| {
            calls += 1;
            if calls == 1 {
                Err(ClientError::Transient("ticketing down".to_string()))
            } else {
                Ok("TICKET-2".to_string())
            }
        });

        let executor =
            ApprovalGateExecutor::new(store.clone(), Arc::new(client), Duration::from_secs(60));
        let step = StepDefinition::approval("gate");

        let (ctx, _rx) = step_context(json!({}));
        assert!(executor.execute(&step, ctx).await.unwrap_err().is_retryable());

        let requests = store.approvals_for_run("run-1").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status, ApprovalStatus::Created);

        let (ctx, _rx) = step_context(json!({}));
        executor.execute(&step, ctx).await.unwrap();

        let requests = store.approvals_for_run("run-1").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_ticket_filed_after_cancel_is_withdrawn() {
        let store = Arc::new(InMemoryStateStore::new());
        let (ctx, _rx) = step_context(json!({}));

        // The run is cancelled while the ticketing call is in flight
        let cancel = ctx.cancel.clone();
        let mut client = MockApprovalClient::new();
        client.expect_create_ticket().times(1).returning(move |_, _, _, _| {
            cancel.cancel();
            Ok("TICKET-9".to_string())
        });

        let executor =
            ApprovalGateExecutor::new(store.clone(), Arc::new(client), Duration::from_secs(60));
        let err = executor
            .execute(&StepDefinition::approval("gate"), ctx)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Cancelled);

        let requests = store.approvals_for_run("run-1").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status, ApprovalStatus::Cancelled);
        assert!(!requests[0].status.is_open());
    }

    #[tokio::test]
    async fn test_summary_template_and_expiry() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut client = MockApprovalClient::new();
        client
            .expect_create_ticket()
            .withf(|_, _, summary, risk| summary == "Promote staging" && *risk == RiskLevel::High)
            .returning(|_, _, _, _| Ok("T".to_string()));

        let executor =
            ApprovalGateExecutor::new(store.clone(), Arc::new(client), Duration::from_secs(60));
        let step = StepDefinition::new(
            "gate",
            StepKind::ApprovalGate {
                expires_in_seconds: Some(5),
                summary: Some("Promote {{ env }}".to_string()),
            },
        );

        let (ctx, _rx) = step_context(json!({}));
        executor.execute(&step, ctx).await.unwrap();

        let request = &store.approvals_for_run("run-1").await.unwrap()[0];
        let ttl = request.expires_at - request.created_at;
        assert!(ttl <= chrono::Duration::seconds(6));
    }
}
