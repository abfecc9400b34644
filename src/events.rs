use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle events broadcast to subscribers of the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SandboxEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String, container: String },
    #[serde(rename_all = "camelCase")]
    SessionDestroyed {
        session_id: String,
        reason: DestroyReason,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        session_id: String,
        execution_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionCompleted {
        session_id: String,
        execution_id: String,
        success: bool,
        execution_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        session_id: Option<String>,
        execution_id: String,
        error_type: String,
    },
    ResourceAlert(ResourceAlert),
    #[serde(rename_all = "camelCase")]
    OrphanRemoved { name: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Requested,
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAlert {
    pub resource: ResourceKind,
    pub severity: AlertSeverity,
    /// Observed usage in percent
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Frame types of a streamed execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Stdout,
    Stderr,
    Plot,
    Variable,
    Complete,
    Error,
}

impl StreamEventType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "plot" => Some(Self::Plot),
            "variable" => Some(Self::Variable),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Plot => "plot",
            Self::Variable => "variable",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// `complete` and `error` end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(event_type: StreamEventType, data: impl Into<Value>) -> Self {
        Self {
            event_type,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_event_wire_shape() {
        let event = StreamEvent::new(StreamEventType::Stdout, "hello\n");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stdout");
        assert_eq!(value["data"], "hello\n");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn sandbox_events_are_tagged() {
        let event = SandboxEvent::SessionDestroyed {
            session_id: "s1".into(),
            reason: DestroyReason::Idle,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "sessionDestroyed", "sessionId": "s1", "reason": "idle"})
        );
    }

    #[test]
    fn terminal_types() {
        assert!(StreamEventType::Complete.is_terminal());
        assert!(!StreamEventType::Plot.is_terminal());
        assert_eq!(StreamEventType::parse("variable"), Some(StreamEventType::Variable));
        assert_eq!(StreamEventType::parse("bogus"), None);
    }
}
