//! REST API for the Conductor workflow engine
//!
//! Every route lives under `/api/v1` except `/health`. Errors are returned as
//! `{"error": CODE, "message": TEXT}` with a status derived from the
//! underlying [`WorkflowError`](conductor_workflow::WorkflowError).

pub mod error;
pub mod rest;

pub use error::{ApiError, ErrorResponse};
pub use rest::router::create_router;

use conductor_workflow::WorkflowEngine;
use std::time::Instant;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}
