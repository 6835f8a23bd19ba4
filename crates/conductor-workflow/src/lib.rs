//! Workflow orchestration engine for Conductor
//!
//! This crate provides a resumable workflow execution engine with:
//! - Declarative, versioned workflow templates validated as a DAG
//! - Dependency-ordered, optionally parallel step execution
//! - Durable checkpoints after every step transition and crash recovery
//! - Decision gates routed by an external reasoning service
//! - Approval gates suspended until an external resume signal
//! - TTL-bounded resource leases shared across concurrent runs
//! - Retry policies with fixed or exponential backoff
//! - Typed progress events on a bounded channel

pub mod approval;
pub mod clients;
pub mod dag;
pub mod decision;
pub mod engine;
pub mod events;
pub mod executor;
pub mod lock;
pub mod render;
pub mod retry;
pub mod run;
pub mod store;
pub mod template;

pub use approval::{ApprovalGateExecutor, ApprovalRequest, ApprovalStatus, ApprovalVerdict};
pub use clients::{
    AgentClient, AgentResponse, ApprovalClient, ClientError, DecisionClient, LocalApprovalClient,
    UnconfiguredClient,
};
pub use dag::{DagValidationError, Evaluation, WorkflowDag};
pub use decision::{Decision, DecisionGateExecutor, RiskLevel};
pub use engine::{EngineBuilder, EngineConfig, WorkflowEngine};
pub use events::{spawn_dispatcher, EventSink, HookError, NotificationHook, TracingHook, WorkflowEvent};
pub use executor::{
    ExecutorSet, StepContext, StepError, StepExecutor, StepOutcome, StepSignal,
};
pub use lock::{
    AcquireMode, AcquireOutcome, InMemoryLockBackend, LockBackend, ResourceLock,
    ResourceLockManager,
};
pub use render::RenderError;
pub use retry::{Backoff, RetryPolicy};
pub use run::{
    RunContext, RunSnapshot, RunStatus, StepRecord, StepState, StepStatus, WaitReason,
    WorkflowRun,
};
pub use store::{InMemoryStateStore, StateStore};
pub use template::{
    ContentionPolicy, InputSpec, LoadedTemplate, LockAction, StepDefinition, StepKind,
    TemplateStore, TemplateSummary, WorkflowTemplate,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("DAG validation error: {0}")]
    DagValidation(#[from] DagValidationError),

    #[error("Template {name} version {version} is not newer than the loaded version")]
    TemplateConflict { name: String, version: u32 },

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidState {
        run_id: String,
        status: RunStatus,
        expected: String,
    },

    #[error("Template render error in step {step_id}: {source}")]
    TemplateRender {
        step_id: String,
        #[source]
        source: RenderError,
    },

    #[error("Lock contention on {resource}: held by run {holder}")]
    LockContention { resource: String, holder: String },

    #[error("Approval expired: {0}")]
    ExpiredApproval(String),

    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Failures of the backing store that may clear on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::Storage(_) | WorkflowError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
