//! Interfaces to the external collaborators a workflow talks to
//!
//! Agents do the actual work, a reasoning service answers decision prompts
//! and a ticketing system hosts approval requests. HTTP implementations live
//! in `conductor-infra`.

use crate::decision::RiskLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Timeouts, connection failures, 5xx and similar
    #[error("transient failure: {0}")]
    Transient(String),

    /// The collaborator refused the request; retrying will not help
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Result of an agent invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    #[serde(default)]
    pub output: Value,
    /// Set when the agent ran but reports failure
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Invokes named agents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(&self, agent: &str, payload: &Value) -> Result<AgentResponse, ClientError>;
}

/// Asks the reasoning service a question and returns its raw answer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String, ClientError>;
}

/// Opens approval tickets in an external system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalClient: Send + Sync {
    /// Returns the external reference of the created ticket
    async fn create_ticket(
        &self,
        run_id: &str,
        step_id: &str,
        summary: &str,
        risk_level: RiskLevel,
    ) -> Result<String, ClientError>;
}

/// Approval client with no external system: requests are resolved only through the API
#[derive(Debug, Clone, Default)]
pub struct LocalApprovalClient;

#[async_trait]
impl ApprovalClient for LocalApprovalClient {
    async fn create_ticket(
        &self,
        run_id: &str,
        step_id: &str,
        _summary: &str,
        risk_level: RiskLevel,
    ) -> Result<String, ClientError> {
        tracing::debug!(run_id = %run_id, step_id = %step_id, ?risk_level, "Local approval ticket");
        Ok(format!("local-{}", uuid::Uuid::new_v4()))
    }
}

/// Placeholder for a collaborator that has not been configured
#[derive(Debug, Clone)]
pub struct UnconfiguredClient {
    name: &'static str,
}

impl UnconfiguredClient {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    fn error(&self) -> ClientError {
        ClientError::Rejected(format!("no {} client configured", self.name))
    }
}

#[async_trait]
impl AgentClient for UnconfiguredClient {
    async fn invoke(&self, _agent: &str, _payload: &Value) -> Result<AgentResponse, ClientError> {
        Err(self.error())
    }
}

#[async_trait]
impl DecisionClient for UnconfiguredClient {
    async fn ask(&self, _prompt: &str) -> Result<String, ClientError> {
        Err(self.error())
    }
}
