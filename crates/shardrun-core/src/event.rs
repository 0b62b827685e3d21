//! Dispatch lifecycle events.

use crate::ids::{HostId, RunId};
use crate::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A lifecycle event for one task of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Host the task targets.
    pub host_id: HostId,
    /// Dispatch slot of the task.
    pub index: usize,
    /// Type of event.
    pub event_type: DispatchEventType,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (attempt, error, status).
    pub metadata: BTreeMap<String, String>,
}

impl DispatchEvent {
    /// Create a new dispatch event.
    pub fn new(
        run_id: RunId,
        host_id: HostId,
        index: usize,
        event_type: DispatchEventType,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id,
            host_id,
            index,
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    /// Create a Dispatched event.
    pub fn dispatched(run_id: RunId, host_id: HostId, index: usize, attempt: u32) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("attempt".to_string(), attempt.to_string());
        Self::new(run_id, host_id, index, DispatchEventType::Dispatched, metadata)
    }

    /// Create an AttemptFailed event.
    pub fn attempt_failed(
        run_id: RunId,
        host_id: HostId,
        index: usize,
        attempt: u32,
        error: &str,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("attempt".to_string(), attempt.to_string());
        metadata.insert("error".to_string(), error.to_string());
        Self::new(run_id, host_id, index, DispatchEventType::AttemptFailed, metadata)
    }

    /// Create a Finished event.
    pub fn finished(run_id: RunId, host_id: HostId, index: usize, status: TaskStatus) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("status".to_string(), status.label().to_string());
        Self::new(run_id, host_id, index, DispatchEventType::Finished, metadata)
    }
}

/// Type of dispatch event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchEventType {
    /// An attempt was launched.
    Dispatched,
    /// An attempt ended without success.
    AttemptFailed,
    /// The task reached its terminal status.
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatched() {
        let run_id = RunId::generate();
        let event = DispatchEvent::dispatched(run_id.clone(), HostId::new("vm-1"), 0, 1);

        assert_eq!(event.run_id, run_id);
        assert_eq!(event.event_type, DispatchEventType::Dispatched);
        assert_eq!(event.metadata.get("attempt"), Some(&"1".to_string()));
        assert!(event.timestamp_ms > 0);
    }

    #[test]
    fn test_attempt_failed() {
        let event = DispatchEvent::attempt_failed(
            RunId::generate(),
            HostId::new("vm-2"),
            1,
            2,
            "Connection failed: refused",
        );

        assert_eq!(event.event_type, DispatchEventType::AttemptFailed);
        assert_eq!(
            event.metadata.get("error"),
            Some(&"Connection failed: refused".to_string())
        );
    }

    #[test]
    fn test_finished() {
        let event =
            DispatchEvent::finished(RunId::generate(), HostId::new("vm-3"), 2, TaskStatus::TimedOut);
        assert_eq!(event.metadata.get("status"), Some(&"TIMEOUT".to_string()));
    }
}
