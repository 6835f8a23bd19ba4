//! Step executors
//!
//! One executor per step kind, selected from a fixed [`ExecutorSet`] by the
//! step's [`StepKind`]. Executors receive a rendered payload and a snapshot of
//! the run context; they never touch run state directly.

use crate::approval::ApprovalGateExecutor;
use crate::clients::{AgentClient, ApprovalClient, ClientError, DecisionClient};
use crate::decision::{Decision, DecisionGateExecutor};
use crate::lock::{AcquireMode, ResourceLockManager};
use crate::render::{render_str, RenderError};
use crate::run::{RunContext, WaitReason};
use crate::store::StateStore;
use crate::template::{ContentionPolicy, LockAction, StepDefinition, StepKind};
use crate::WorkflowError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Progress reported by an executor while it is still running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSignal {
    WaitingLock {
        step_id: String,
        resource: String,
        holder: String,
    },
    LockAcquired {
        step_id: String,
        resource: String,
    },
}

/// Everything an executor gets for one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step_id: String,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Payload after placeholder rendering
    pub payload: Value,
    pub context: RunContext,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub signals: mpsc::UnboundedSender<StepSignal>,
}

impl StepContext {
    fn signal(&self, signal: StepSignal) {
        // The driver may already be gone during shutdown
        let _ = self.signals.send(signal);
    }
}

/// Successful result of an attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished with an output
    Completed { output: Value },
    /// Decision gate answered
    Decided { decision: Decision },
    /// Step suspended until a resume call
    Suspended {
        output: Option<Value>,
        wait: WaitReason,
    },
}

/// Failed attempt
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("resource {resource} is held by run {holder}")]
    LockContention { resource: String, holder: String },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::Retryable(_) | StepError::LockContention { .. }
        )
    }
}

impl From<ClientError> for StepError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transient(msg) => StepError::Retryable(msg),
            ClientError::Rejected(msg) => StepError::Fatal(msg),
        }
    }
}

impl From<WorkflowError> for StepError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::LockContention { resource, holder } => {
                StepError::LockContention { resource, holder }
            }
            WorkflowError::Cancelled(_) => StepError::Cancelled,
            WorkflowError::TemplateRender { source, .. } => StepError::Render(source),
            other => StepError::Retryable(other.to_string()),
        }
    }
}

/// Handler for one step kind
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<StepOutcome, StepError>;
}

/// Run a collaborator call under the step timeout and cancellation token
pub(crate) async fn bounded<T, F>(ctx: &StepContext, what: &str, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>>,
{
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
        result = tokio::time::timeout(ctx.timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(StepError::Retryable(format!(
                "{} timed out after {:?}",
                what, ctx.timeout
            ))),
        },
    }
}

/// Invokes an agent with the rendered payload
pub struct AgentCallExecutor {
    client: Arc<dyn AgentClient>,
}

impl AgentCallExecutor {
    pub fn new(client: Arc<dyn AgentClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepExecutor for AgentCallExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<StepOutcome, StepError> {
        let StepKind::AgentCall {
            agent,
            await_callback,
        } = &step.kind
        else {
            return Err(StepError::Fatal(format!("{} is not an agent call", step.id)));
        };

        debug!(run_id = %ctx.run_id, step_id = %ctx.step_id, agent = %agent, "Invoking agent");

        let response = bounded(&ctx, "agent call", async {
            self.client
                .invoke(agent, &ctx.payload)
                .await
                .map_err(StepError::from)
        })
        .await?;

        if let Some(error) = response.error {
            return Err(StepError::Retryable(format!("agent {} failed: {}", agent, error)));
        }

        if *await_callback {
            return Ok(StepOutcome::Suspended {
                output: Some(response.output),
                wait: WaitReason::External,
            });
        }

        Ok(StepOutcome::Completed {
            output: response.output,
        })
    }
}

/// Acquires or releases a resource lease on behalf of the run
pub struct ResourceLockExecutor {
    locks: Arc<ResourceLockManager>,
}

impl ResourceLockExecutor {
    pub fn new(locks: Arc<ResourceLockManager>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl StepExecutor for ResourceLockExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<StepOutcome, StepError> {
        let StepKind::ResourceLock {
            resource,
            action,
            ttl_seconds,
            on_contention,
        } = &step.kind
        else {
            return Err(StepError::Fatal(format!("{} is not a resource lock", step.id)));
        };

        let key = render_str(resource, &ctx.context)?;

        match action {
            LockAction::Release => {
                let released = self.locks.release(&key, &ctx.run_id).await?;
                Ok(StepOutcome::Completed {
                    output: json!({ "resource": key, "released": released }),
                })
            }
            LockAction::Acquire => {
                let mode = match on_contention {
                    ContentionPolicy::Wait => AcquireMode::Wait {
                        timeout: ctx.timeout,
                    },
                    ContentionPolicy::FailFast => AcquireMode::FailFast,
                };
                let ttl = ttl_seconds.map(Duration::from_secs);

                let signal_ctx = ctx.clone();
                let blocked_key = key.clone();
                let lock = self
                    .locks
                    .acquire(&key, &ctx.run_id, ttl, mode, &ctx.cancel, move |holder| {
                        signal_ctx.signal(StepSignal::WaitingLock {
                            step_id: signal_ctx.step_id.clone(),
                            resource: blocked_key,
                            holder: holder.holder_run_id.clone(),
                        });
                    })
                    .await?;

                ctx.signal(StepSignal::LockAcquired {
                    step_id: ctx.step_id.clone(),
                    resource: key.clone(),
                });
                info!(run_id = %ctx.run_id, resource = %key, "Resource lock acquired");

                Ok(StepOutcome::Completed {
                    output: json!({
                        "resource": lock.resource_key,
                        "holder": lock.holder_run_id,
                        "expires_at": lock.expires_at,
                    }),
                })
            }
        }
    }
}

/// Joins branches: output is the map of dependency outputs that exist
pub struct MergeExecutor;

#[async_trait]
impl StepExecutor for MergeExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<StepOutcome, StepError> {
        let mut joined = Map::new();
        for dep in &step.depends_on {
            if let Some(output) = ctx.context.output(dep) {
                joined.insert(dep.clone(), output.clone());
            }
        }

        Ok(StepOutcome::Completed {
            output: Value::Object(joined),
        })
    }
}

/// Fixed dispatch table from step kind to executor
#[derive(Clone)]
pub struct ExecutorSet {
    agent: Arc<dyn StepExecutor>,
    decision: Arc<dyn StepExecutor>,
    approval: Arc<dyn StepExecutor>,
    lock: Arc<dyn StepExecutor>,
    merge: Arc<dyn StepExecutor>,
}

impl ExecutorSet {
    pub fn new(
        agents: Arc<dyn AgentClient>,
        decisions: Arc<dyn DecisionClient>,
        approvals: Arc<dyn ApprovalClient>,
        store: Arc<dyn StateStore>,
        locks: Arc<ResourceLockManager>,
        approval_expiry: Duration,
    ) -> Self {
        Self {
            agent: Arc::new(AgentCallExecutor::new(agents)),
            decision: Arc::new(DecisionGateExecutor::new(decisions)),
            approval: Arc::new(ApprovalGateExecutor::new(store, approvals, approval_expiry)),
            lock: Arc::new(ResourceLockExecutor::new(locks)),
            merge: Arc::new(MergeExecutor),
        }
    }

    pub fn with_agent_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.agent = executor;
        self
    }

    pub fn with_decision_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.decision = executor;
        self
    }

    pub fn with_approval_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.approval = executor;
        self
    }

    pub fn for_kind(&self, kind: &StepKind) -> Arc<dyn StepExecutor> {
        match kind {
            StepKind::AgentCall { .. } => self.agent.clone(),
            StepKind::DecisionGate { .. } => self.decision.clone(),
            StepKind::ApprovalGate { .. } => self.approval.clone(),
            StepKind::ResourceLock { .. } => self.lock.clone(),
            StepKind::Merge => self.merge.clone(),
        }
    }
}
