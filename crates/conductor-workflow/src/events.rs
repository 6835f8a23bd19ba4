//! Workflow progress events
//!
//! The engine publishes typed events into a bounded channel. A dispatcher
//! task drains the channel into notification hooks. Publishing never blocks
//! the engine: when the channel is full the event is dropped.

use crate::approval::ApprovalStatus;
use crate::decision::RiskLevel;
use crate::run::RunStatus;
use async_trait::async_trait;
use conductor_core::Event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunCreated {
        run_id: String,
        template_name: String,
        template_version: u32,
    },
    RunStatusChanged {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        run_id: String,
        step_id: String,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    StepSucceeded {
        run_id: String,
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        attempts: u32,
        error: String,
    },
    StepSkipped {
        run_id: String,
        step_id: String,
    },
    DecisionMade {
        run_id: String,
        step_id: String,
        decision: String,
        risk_level: RiskLevel,
        route: Option<String>,
    },
    ApprovalRequested {
        run_id: String,
        step_id: String,
        request_id: String,
    },
    ApprovalResolved {
        run_id: String,
        step_id: String,
        request_id: String,
        status: ApprovalStatus,
    },
    LockWaiting {
        run_id: String,
        step_id: String,
        resource: String,
        holder: String,
    },
    LockAcquired {
        run_id: String,
        step_id: String,
        resource: String,
    },
    LocksReleased {
        run_id: String,
        resources: Vec<String>,
    },
}

impl WorkflowEvent {
    /// Dotted event type used for subscription patterns
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::RunCreated { .. } => "run.created",
            WorkflowEvent::RunStatusChanged { .. } => "run.status_changed",
            WorkflowEvent::RunCompleted { .. } => "run.completed",
            WorkflowEvent::RunFailed { .. } => "run.failed",
            WorkflowEvent::RunCancelled { .. } => "run.cancelled",
            WorkflowEvent::StepStarted { .. } => "step.started",
            WorkflowEvent::StepRetrying { .. } => "step.retrying",
            WorkflowEvent::StepSucceeded { .. } => "step.succeeded",
            WorkflowEvent::StepFailed { .. } => "step.failed",
            WorkflowEvent::StepSkipped { .. } => "step.skipped",
            WorkflowEvent::DecisionMade { .. } => "decision.made",
            WorkflowEvent::ApprovalRequested { .. } => "approval.requested",
            WorkflowEvent::ApprovalResolved { .. } => "approval.resolved",
            WorkflowEvent::LockWaiting { .. } => "lock.waiting",
            WorkflowEvent::LockAcquired { .. } => "lock.acquired",
            WorkflowEvent::LocksReleased { .. } => "lock.released",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            WorkflowEvent::RunCreated { run_id, .. }
            | WorkflowEvent::RunStatusChanged { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepSucceeded { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::DecisionMade { run_id, .. }
            | WorkflowEvent::ApprovalRequested { run_id, .. }
            | WorkflowEvent::ApprovalResolved { run_id, .. }
            | WorkflowEvent::LockWaiting { run_id, .. }
            | WorkflowEvent::LockAcquired { run_id, .. }
            | WorkflowEvent::LocksReleased { run_id, .. } => run_id,
        }
    }

    /// Wrap in the generic envelope delivered to external subscribers
    pub fn to_event(&self) -> Event {
        Event::new(self.event_type(), self).with_metadata("run_id", self.run_id())
    }
}

/// Producer half of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<WorkflowEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Fire-and-forget publish
    pub fn emit(&self, event: WorkflowEvent) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    debug!(event_type = event.event_type(), run_id = %event.run_id(), "Event channel full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Event channel closed");
                }
            }
        }
    }
}

/// Receives events drained from the channel
#[async_trait]
pub trait NotificationHook: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &WorkflowEvent) -> Result<(), HookError>;
}

/// Delivery failure reported by a hook; logged by the dispatcher
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Logs every event through tracing
#[derive(Debug, Clone, Default)]
pub struct TracingHook;

#[async_trait]
impl NotificationHook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &WorkflowEvent) -> Result<(), HookError> {
        info!(
            event_type = event.event_type(),
            run_id = %event.run_id(),
            event = ?event,
            "Workflow event"
        );
        Ok(())
    }
}

/// Drain the channel into the hooks until every sender is dropped
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<WorkflowEvent>,
    hooks: Vec<Arc<dyn NotificationHook>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for hook in &hooks {
                if let Err(e) = hook.notify(&event).await {
                    warn!(hook = hook.name(), event_type = event.event_type(), error = %e, "Notification hook failed");
                }
            }
        }
        debug!("Event dispatcher stopped");
    })
}
