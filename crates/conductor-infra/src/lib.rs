//! Infrastructure adapters for Conductor
//!
//! Durable state stores (file, Redis), a Redis lease backend, HTTP clients for
//! the agent, decision and approval services, and a webhook notifier.

pub mod clients;
pub mod connection;
pub mod lock;
pub mod store;
pub mod webhook;

pub use clients::{HttpAgentClient, HttpApprovalClient, HttpClientConfig, HttpDecisionClient};
pub use connection::RedisConfig;
pub use lock::RedisLockBackend;
pub use store::file::FileStateStore;
pub use store::redis::RedisStateStore;
pub use webhook::{WebhookConfig, WebhookNotifier};

use conductor_workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, InfraError>;

impl From<InfraError> for WorkflowError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Serialization(e) => WorkflowError::Serialization(e),
            InfraError::Io(e) => WorkflowError::Io(e),
            other => WorkflowError::Storage(other.to_string()),
        }
    }
}
