//! Event envelope shared by notification sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A published event in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Event type (e.g., "run.created", "step.succeeded")
    pub event_type: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: serde_json::Value,
    /// Metadata for the event
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the event matches a given type pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self.event_type.starts_with(prefix);
        }
        self.event_type == pattern
    }

    /// True if any pattern matches. An empty pattern list matches everything.
    pub fn matches_any(&self, patterns: &[String]) -> bool {
        patterns.is_empty() || patterns.iter().any(|p| self.matches(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new("run.created", serde_json::json!({"run_id": "r1"}));

        assert!(!event.id.is_nil());
        assert_eq!(event.event_type, "run.created");
        assert_eq!(event.payload["run_id"], "r1");
    }

    #[test]
    fn test_event_with_metadata() {
        let event = Event::new("run.created", serde_json::json!({}))
            .with_metadata("template", "deploy")
            .with_metadata("version", "2");

        assert_eq!(event.metadata.get("template"), Some(&"deploy".to_string()));
        assert_eq!(event.metadata.get("version"), Some(&"2".to_string()));
    }

    #[test]
    fn test_event_matches() {
        let event = Event::new("step.succeeded", serde_json::json!({}));

        assert!(event.matches("*"));
        assert!(event.matches("step.succeeded"));
        assert!(event.matches("step.*"));
        assert!(!event.matches("run.*"));
        assert!(!event.matches("step.failed"));
    }

    #[test]
    fn test_matches_any() {
        let event = Event::new("run.completed", serde_json::json!({}));

        assert!(event.matches_any(&[]));
        assert!(event.matches_any(&["step.*".to_string(), "run.*".to_string()]));
        assert!(!event.matches_any(&["lock.*".to_string()]));
    }
}
