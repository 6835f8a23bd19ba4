//! Core configuration and shared types for the Conductor workflow engine.

pub mod config;
pub mod events;

pub use config::*;
pub use events::Event;
