use at_bridge::event_bus::EventBus;
use at_bridge::protocol::BridgeMessage;

#[test]
fn test_new_bus_has_no_subscribers() {
    let bus: EventBus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_subscribe_increments_count() {
    let bus: EventBus = EventBus::new();
    let _rx1 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 1);
    let _rx2 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);
}

#[test]
fn test_publish_delivers_to_multiple_subscribers() {
    let bus: EventBus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();

    bus.publish(BridgeMessage::QueueUnblocked);

    assert_eq!(rx1.try_recv().unwrap(), BridgeMessage::QueueUnblocked);
    assert_eq!(rx2.try_recv().unwrap(), BridgeMessage::QueueUnblocked);
}

#[test]
fn test_dropped_receiver_is_pruned() {
    let bus: EventBus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    drop(rx1);
    assert_eq!(bus.subscriber_count(), 1);

    bus.publish(BridgeMessage::TaskPromoted { task_id: "001-a".into() });
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn test_messages_published_before_subscribe_are_not_seen() {
    let bus: EventBus = EventBus::new();
    bus.publish(BridgeMessage::QueueUnblocked);
    let rx = bus.subscribe();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_generic_payloads_and_shared_clones() {
    let bus: EventBus<u32> = EventBus::new();
    let clone = bus.clone();
    let rx = bus.subscribe();

    clone.publish(7);
    clone.publish(8);

    let got: Vec<u32> = rx.try_iter().collect();
    assert_eq!(got, vec![7, 8]);
}

#[tokio::test]
async fn test_async_receive() {
    let bus: EventBus = EventBus::new();
    let rx = bus.subscribe();

    let publisher = bus.clone();
    tokio::spawn(async move {
        publisher.publish(BridgeMessage::QueueUnblocked);
    });

    let msg = rx.recv_async().await.expect("message");
    assert_eq!(msg.kind(), "queue_unblocked");
}
