use at_core::types::{ActivityState, ReviewReason, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events published by the daemon for UI and CLI consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum BridgeMessage {
    ActivityStateChanged {
        from: ActivityState,
        to: ActivityState,
        timestamp: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        review_reason: Option<ReviewReason>,
    },
    TaskPromoted {
        task_id: String,
    },
    QueueBlocked {
        reason: String,
        task_id: Option<String>,
    },
    QueueUnblocked,
    RecoveryDispatched(RecoveryPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPayload {
    pub message_id: Uuid,
    pub destination: String,
    pub task_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl BridgeMessage {
    /// Short event name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::ActivityStateChanged { .. } => "activity_state_changed",
            BridgeMessage::TaskStatusChanged { .. } => "task_status_changed",
            BridgeMessage::TaskPromoted { .. } => "task_promoted",
            BridgeMessage::QueueBlocked { .. } => "queue_blocked",
            BridgeMessage::QueueUnblocked => "queue_unblocked",
            BridgeMessage::RecoveryDispatched(_) => "recovery_dispatched",
        }
    }
}
