//! Durable [`StateStore`](conductor_workflow::StateStore) implementations

pub mod file;
pub mod redis;
