use std::sync::{Arc, Mutex};

use at_core::task_store::{InMemoryTaskStore, JsonTaskStore, TaskStore};
use at_core::types::{ReviewReason, StoreEvent, Task, TaskStatus};

fn recorder(store: &dyn TaskStore) -> (Arc<Mutex<Vec<StoreEvent>>>, at_core::task_store::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = store.subscribe(Arc::new(move |e: &StoreEvent| {
        sink.lock().unwrap().push(e.clone());
    }));
    (seen, sub)
}

#[tokio::test]
async fn list_preserves_insertion_order() {
    let store = InMemoryTaskStore::new();
    for id in ["003-c", "001-a", "002-b"] {
        store.upsert(Task::new(id, id)).await.unwrap();
    }
    let ids: Vec<String> = store
        .list_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["003-c", "001-a", "002-b"]);
}

#[tokio::test]
async fn review_reason_change_is_a_transition() {
    let store = InMemoryTaskStore::with_tasks(vec![
        Task::new("001-a", "a").with_status(TaskStatus::InProgress)
    ]);
    let (seen, _sub) = recorder(&store);

    store
        .update_status("001-a", TaskStatus::HumanReview, Some(ReviewReason::Errors))
        .await
        .unwrap();
    store
        .update_status("001-a", TaskStatus::HumanReview, Some(ReviewReason::Stopped))
        .await
        .unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    let StoreEvent::Transition(last) = &events[1] else {
        panic!("expected transition");
    };
    assert_eq!(last.from, TaskStatus::HumanReview);
    assert_eq!(last.review_reason, Some(ReviewReason::Stopped));
}

#[tokio::test]
async fn upsert_with_new_status_reports_transition() {
    let store = InMemoryTaskStore::with_tasks(vec![Task::new("001-a", "a")]);
    let (seen, _sub) = recorder(&store);

    let mut task = store.get_task("001-a").await.unwrap().unwrap();
    task.status = TaskStatus::Queue;
    store.upsert(task).await.unwrap();

    assert!(matches!(
        seen.lock().unwrap().as_slice(),
        [StoreEvent::Transition(t)] if t.to == TaskStatus::Queue
    ));
}

#[tokio::test]
async fn json_store_writes_pretty_array() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board").join("tasks.json");
    let store = JsonTaskStore::open(&path).await.unwrap();

    store.upsert(Task::new("001-a", "Add login")).await.unwrap();
    store.archive("001-a").await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value[0]["id"], "001-a");
    assert_eq!(value[0]["metadata"]["archived"], true);
}

#[tokio::test]
async fn json_store_remove_retires_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonTaskStore::open(dir.path().join("tasks.json")).await.unwrap();
    store.upsert(Task::new("001-a", "a")).await.unwrap();
    let (seen, _sub) = recorder(&store);

    store.remove("001-a").await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![StoreEvent::Retired { task_id: "001-a".into() }]
    );
    assert!(store.get_task("001-a").await.unwrap().is_none());
}
