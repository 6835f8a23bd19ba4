//! REST API implementation using Axum

pub mod handlers;
pub mod middleware;
pub mod router;
