use at_bridge::protocol::{BridgeMessage, RecoveryPayload};
use at_core::types::{ActivityState, ReviewReason, TaskStatus};
use chrono::Utc;
use uuid::Uuid;

#[test]
fn activity_change_serializes_with_tag_and_payload() {
    let msg = BridgeMessage::ActivityStateChanged {
        from: ActivityState::Processing,
        to: ActivityState::Idle,
        timestamp: Utc::now(),
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "activity_state_changed");
    assert_eq!(value["payload"]["from"], "PROCESSING");
    assert_eq!(value["payload"]["to"], "IDLE");
}

#[test]
fn unit_variant_has_no_payload() {
    let value = serde_json::to_value(BridgeMessage::QueueUnblocked).unwrap();
    assert_eq!(value["type"], "queue_unblocked");
    assert!(value.get("payload").is_none());
}

#[test]
fn task_status_change_roundtrip() {
    let msg = BridgeMessage::TaskStatusChanged {
        task_id: "004-d".into(),
        from: TaskStatus::InProgress,
        to: TaskStatus::HumanReview,
        review_reason: Some(ReviewReason::Errors),
    };
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"human_review\""));
    let back: BridgeMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn kind_matches_serialized_tag() {
    let messages = vec![
        BridgeMessage::TaskPromoted { task_id: "a".into() },
        BridgeMessage::QueueBlocked { reason: "r".into(), task_id: None },
        BridgeMessage::RecoveryDispatched(RecoveryPayload {
            message_id: Uuid::new_v4(),
            destination: "claude:0".into(),
            task_ids: vec!["a".into()],
            timestamp: Utc::now(),
        }),
    ];
    for msg in messages {
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind());
    }
}
