//! Task persistence contract and the in-process implementations.
//!
//! Observers registered with [`TaskStore::subscribe`] are plain synchronous
//! callbacks. They run after the in-memory table has been updated and before
//! the awaiting caller of the mutating method resumes, so anything they set
//! (a queue block, for instance) is visible to the very next line of code
//! that caller executes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::types::{ReviewReason, StatusTransition, StoreEvent, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(String),
    #[error("serialize: {0}")]
    Serialize(String),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

pub type Observer = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(u64, Observer)>,
}

/// Registry of store observers. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<Mutex<ObserverList>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Observer) -> Subscription {
        let mut list = self.inner.lock().expect("observer registry poisoned");
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, observer));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Call every observer. The registry lock is released first so observers
    /// may subscribe or unsubscribe while handling the event.
    pub fn notify(&self, event: &StoreEvent) {
        let snapshot: Vec<Observer> = {
            let list = self.inner.lock().expect("observer registry poisoned");
            list.entries.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in snapshot {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("observer registry poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`TaskStore::subscribe`]. Dropping it unregisters the
/// observer.
#[must_use = "dropping the subscription unregisters the observer"]
pub struct Subscription {
    registry: Weak<Mutex<ObserverList>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut list) = registry.lock() {
                list.entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Single source of truth for task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Current task list, archived tasks included.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Change a task's status and persist it. Observers see a
    /// [`StoreEvent::Transition`] when the status actually changed.
    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    ) -> Result<Task>;

    /// Bump the recovery attempt counter after a recovery message named the task.
    async fn record_recovery_attempt(&self, id: &str) -> Result<Task>;

    /// Insert or replace a task.
    async fn upsert(&self, task: Task) -> Result<()>;

    /// Hard delete.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Soft delete via `metadata.archived`.
    async fn archive(&self, id: &str) -> Result<()>;

    fn subscribe(&self, observer: Observer) -> Subscription;
}

// ---------------------------------------------------------------------------
// TaskTable
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TaskTable {
    order: Vec<String>,
    tasks: HashMap<String, Task>,
    /// Bumped on every change to a task; tells a rollback whether anything
    /// else touched the task since.
    revisions: HashMap<String, u64>,
    next_revision: u64,
}

impl TaskTable {
    fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut table = Self::default();
        for task in tasks {
            table.put(task);
        }
        table
    }

    fn put(&mut self, task: Task) -> Option<Task> {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.touch(&task.id);
        self.tasks.insert(task.id.clone(), task)
    }

    fn take(&mut self, id: &str) -> Option<Task> {
        let removed = self.tasks.remove(id);
        if removed.is_some() {
            self.order.retain(|t| t != id);
            self.revisions.remove(id);
        }
        removed
    }

    fn touch(&mut self, id: &str) -> u64 {
        self.next_revision += 1;
        self.revisions.insert(id.to_string(), self.next_revision);
        self.next_revision
    }

    fn revision(&self, id: &str) -> Option<u64> {
        self.revisions.get(id).copied()
    }

    fn list(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }
}

/// Compute the event, if any, produced by replacing `before` with `after`.
fn event_for(before: Option<&Task>, after: &Task) -> Option<StoreEvent> {
    let before = before?;
    if !before.is_archived() && after.is_archived() {
        return Some(StoreEvent::Retired {
            task_id: after.id.clone(),
        });
    }
    if before.status != after.status || before.review_reason != after.review_reason {
        return Some(StoreEvent::Transition(StatusTransition::new(
            after.id.clone(),
            before.status,
            after.status,
            after.review_reason,
        )));
    }
    None
}

// ---------------------------------------------------------------------------
// InMemoryTaskStore
// ---------------------------------------------------------------------------

/// Task store kept entirely in memory.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    table: Arc<Mutex<TaskTable>>,
    observers: Observers,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            table: Arc::new(Mutex::new(TaskTable::from_tasks(tasks))),
            observers: Observers::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskTable> {
        self.table.lock().expect("task table poisoned")
    }

    /// Apply `f` to the task, returning (before, after, revision).
    fn modify<F>(&self, id: &str, f: F) -> Result<(Task, Task, u64)>
    where
        F: FnOnce(&mut Task),
    {
        let mut table = self.lock();
        let task = table
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
        let before = task.clone();
        f(task);
        let after = task.clone();
        let revision = table.touch(id);
        Ok((before, after, revision))
    }

    /// Undo the change that produced `revision`. An untouched task goes back
    /// to `before` (or away, if it was new); a task changed since only gets
    /// `undo`, so the later changes survive.
    fn roll_back<U>(&self, id: &str, before: Option<Task>, revision: u64, undo: U)
    where
        U: FnOnce(&mut Task),
    {
        let mut table = self.lock();
        if table.revision(id) == Some(revision) {
            match before {
                Some(prev) => {
                    table.put(prev);
                }
                None => {
                    table.take(id);
                }
            }
            return;
        }
        if let Some(task) = table.tasks.get_mut(id) {
            undo(task);
            table.touch(id);
        }
    }

    fn emit(&self, event: Option<StoreEvent>) {
        if let Some(event) = event {
            debug!(?event, "task store event");
            self.observers.notify(&event);
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().list())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    ) -> Result<Task> {
        let (before, after, _) = self.modify(id, |t| t.set_status(status, review_reason))?;
        self.emit(event_for(Some(&before), &after));
        Ok(after)
    }

    async fn record_recovery_attempt(&self, id: &str) -> Result<Task> {
        let (_, after, _) = self.modify(id, |t| {
            t.metadata.rdr_attempts += 1;
            t.metadata.last_rdr_at = Some(Utc::now());
        })?;
        Ok(after)
    }

    async fn upsert(&self, task: Task) -> Result<()> {
        let after = task.clone();
        let before = self.lock().put(task);
        self.emit(event_for(before.as_ref(), &after));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.lock().take(id);
        match removed {
            Some(_) => {
                self.emit(Some(StoreEvent::Retired {
                    task_id: id.to_string(),
                }));
                Ok(())
            }
            None => Err(TaskStoreError::NotFound(id.to_string())),
        }
    }

    async fn archive(&self, id: &str) -> Result<()> {
        let (before, after, _) = self.modify(id, |t| {
            t.metadata.archived = true;
            t.updated_at = Utc::now();
        })?;
        self.emit(event_for(Some(&before), &after));
        Ok(())
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        self.observers.subscribe(observer)
    }
}

// ---------------------------------------------------------------------------
// JsonTaskStore
// ---------------------------------------------------------------------------

/// Task store persisted as a JSON array in a single file.
///
/// Each mutation is written to disk before observers are notified. A failed
/// write rolls the in-memory change back and returns the error.
pub struct JsonTaskStore {
    path: PathBuf,
    memory: InMemoryTaskStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonTaskStore {
    /// Open (or create) the store at `path`.
    ///
    /// Entries that fail to deserialize are kept as tasks carrying
    /// `metadata.plan_error` when their `id` can be recovered.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tasks = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_task_file(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(TaskStoreError::Io(e.to_string())),
        };
        debug!(path = %path.display(), count = tasks.len(), "task store loaded");
        Ok(Self {
            path,
            memory: InMemoryTaskStore::with_tasks(tasks),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let tasks = self.memory.lock().list();
        let text = serde_json::to_string_pretty(&tasks)
            .map_err(|e| TaskStoreError::Serialize(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskStoreError::Io(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| TaskStoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| TaskStoreError::Io(e.to_string()))
    }

    /// Persist a change already applied in memory. On failure the change is
    /// rolled back; `undo` reverts just the fields it wrote, for when the
    /// task was changed again while the write was pending.
    async fn commit<U>(&self, before: Option<Task>, after: &Task, revision: u64, undo: U) -> Result<()>
    where
        U: FnOnce(&mut Task) + Send,
    {
        if let Err(e) = self.flush().await {
            warn!(task_id = %after.id, error = %e, "persisting task failed, rolling back");
            self.memory.roll_back(&after.id, before, revision, undo);
            return Err(e);
        }
        self.memory.emit(event_for(before.as_ref(), after));
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.memory.list_tasks().await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.memory.get_task(id).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    ) -> Result<Task> {
        let (before, after, revision) = self
            .memory
            .modify(id, |t| t.set_status(status, review_reason))?;
        let (prev_status, prev_reason) = (before.status, before.review_reason);
        let (new_status, new_reason) = (after.status, after.review_reason);
        self.commit(Some(before), &after, revision, move |t| {
            if t.status == new_status && t.review_reason == new_reason {
                t.status = prev_status;
                t.review_reason = prev_reason;
            }
        })
        .await?;
        Ok(after)
    }

    async fn record_recovery_attempt(&self, id: &str) -> Result<Task> {
        let (before, after, revision) = self.memory.modify(id, |t| {
            t.metadata.rdr_attempts += 1;
            t.metadata.last_rdr_at = Some(Utc::now());
        })?;
        let prev_at = before.metadata.last_rdr_at;
        let new_at = after.metadata.last_rdr_at;
        self.commit(Some(before), &after, revision, move |t| {
            t.metadata.rdr_attempts = t.metadata.rdr_attempts.saturating_sub(1);
            if t.metadata.last_rdr_at == new_at {
                t.metadata.last_rdr_at = prev_at;
            }
        })
        .await?;
        Ok(after)
    }

    async fn upsert(&self, task: Task) -> Result<()> {
        let after = task.clone();
        let (before, revision) = {
            let mut table = self.memory.lock();
            let before = table.put(task);
            (before, table.revision(&after.id).unwrap_or_default())
        };
        // A later write replaced the whole task; there is nothing of ours left.
        self.commit(before, &after, revision, |_| {}).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let removed = self
            .memory
            .lock()
            .take(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
        if let Err(e) = self.flush().await {
            warn!(task_id = %id, error = %e, "persisting removal failed, restoring task");
            let mut table = self.memory.lock();
            if !table.tasks.contains_key(id) {
                table.put(removed);
            }
            return Err(e);
        }
        self.memory.emit(Some(StoreEvent::Retired {
            task_id: id.to_string(),
        }));
        Ok(())
    }

    async fn archive(&self, id: &str) -> Result<()> {
        let (before, after, revision) = self.memory.modify(id, |t| {
            t.metadata.archived = true;
            t.updated_at = Utc::now();
        })?;
        let was_archived = before.is_archived();
        self.commit(Some(before), &after, revision, move |t| {
            t.metadata.archived = was_archived;
        })
        .await
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        self.memory.subscribe(observer)
    }
}

/// Parse a task file, tolerating individually malformed entries.
fn parse_task_file(text: &str) -> Result<Vec<Task>> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|e| TaskStoreError::Serialize(e.to_string()))?;

    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<Task>(entry.clone()) {
            Ok(task) => tasks.push(task),
            Err(e) => match corrupted_placeholder(&entry, &e.to_string()) {
                Some(task) => {
                    warn!(task_id = %task.id, error = %e, "task entry corrupted, keeping placeholder");
                    tasks.push(task);
                }
                None => warn!(error = %e, "skipping task entry without an id"),
            },
        }
    }
    Ok(tasks)
}

fn corrupted_placeholder(entry: &serde_json::Value, error: &str) -> Option<Task> {
    let id = entry.get("id")?.as_str()?;
    let title = entry
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or(id)
        .to_string();
    let status = entry
        .get("status")
        .and_then(|s| serde_json::from_value::<TaskStatus>(s.clone()).ok())
        .unwrap_or(TaskStatus::Error);
    let mut task = Task::new(id, title).with_status(status);
    task.metadata.plan_error = Some(error.to_string());
    Some(task)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn update_status_notifies_observers_synchronously() {
        let store = InMemoryTaskStore::with_tasks(vec![
            Task::new("001-a", "a").with_status(TaskStatus::Queue)
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(Arc::new(move |e: &StoreEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        store
            .update_status("001-a", TaskStatus::InProgress, None)
            .await
            .unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StoreEvent::Transition(t) => {
                assert_eq!(t.from, TaskStatus::Queue);
                assert_eq!(t.to, TaskStatus::InProgress);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_status_emits_nothing() {
        let store = InMemoryTaskStore::with_tasks(vec![Task::new("001-a", "a")]);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = store.subscribe(Arc::new(move |_: &StoreEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        store
            .update_status("001-a", TaskStatus::Backlog, None)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let store = InMemoryTaskStore::with_tasks(vec![Task::new("001-a", "a")]);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = store.subscribe(Arc::new(move |_: &StoreEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        drop(sub);
        store
            .update_status("001-a", TaskStatus::Queue, None)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(store.observers.is_empty());
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store
            .update_status("nope", TaskStatus::Queue, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn archive_and_remove_retire_the_task() {
        let store = InMemoryTaskStore::with_tasks(vec![
            Task::new("001-a", "a"),
            Task::new("002-b", "b"),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(Arc::new(move |e: &StoreEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        store.archive("001-a").await.unwrap();
        store.remove("002-b").await.unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                StoreEvent::Retired { task_id: "001-a".into() },
                StoreEvent::Retired { task_id: "002-b".into() },
            ]
        );
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let store = JsonTaskStore::open(&path).await.unwrap();
        store
            .upsert(Task::new("001-a", "a").with_status(TaskStatus::Queue))
            .await
            .unwrap();
        store
            .update_status("001-a", TaskStatus::InProgress, None)
            .await
            .unwrap();
        store.record_recovery_attempt("001-a").await.unwrap();

        let reopened = JsonTaskStore::open(&path).await.unwrap();
        let task = reopened.get_task("001-a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.metadata.rdr_attempts, 1);
    }

    #[tokio::test]
    async fn corrupted_entries_become_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "001-bad", "title": "bad", "status": "in_progress", "createdAt": 12},
                {"title": "no id at all"}
            ]"#,
        )
        .unwrap();

        let store = JsonTaskStore::open(&path).await.unwrap();
        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "001-bad");
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
        assert!(tasks[0].metadata.plan_error.is_some());
    }

    /// Make every further write of a store at `dir/board/tasks.json` fail.
    fn break_board_dir(dir: &Path) {
        std::fs::remove_dir_all(dir.join("board")).unwrap();
        std::fs::write(dir.join("board"), "not a directory").unwrap();
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::open(dir.path().join("board").join("tasks.json"))
            .await
            .unwrap();
        store
            .upsert(Task::new("001-a", "a").with_status(TaskStatus::Queue))
            .await
            .unwrap();
        break_board_dir(dir.path());

        assert!(store
            .update_status("001-a", TaskStatus::InProgress, None)
            .await
            .is_err());
        assert_eq!(store.get_task("001-a").await.unwrap().unwrap().status, TaskStatus::Queue);

        assert!(store.upsert(Task::new("002-b", "b")).await.is_err());
        assert!(store.get_task("002-b").await.unwrap().is_none());

        assert!(store.remove("001-a").await.is_err());
        assert!(store.get_task("001-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_write_keeps_changes_made_while_it_was_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonTaskStore::open(dir.path().join("board").join("tasks.json"))
                .await
                .unwrap(),
        );
        store
            .upsert(Task::new("001-a", "a").with_status(TaskStatus::Queue))
            .await
            .unwrap();
        break_board_dir(dir.path());

        let held = store.write_lock.lock().await;
        let pending = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                store
                    .update_status("001-a", TaskStatus::InProgress, None)
                    .await
            }
        });
        loop {
            let status = store.memory.lock().tasks["001-a"].status;
            if status == TaskStatus::InProgress {
                break;
            }
            tokio::task::yield_now().await;
        }

        // Another change lands in memory while the write waits for the lock.
        store
            .memory
            .modify("001-a", |t| t.metadata.rdr_attempts = 4)
            .unwrap();
        drop(held);

        assert!(pending.await.unwrap().is_err());
        let task = store.get_task("001-a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queue);
        assert_eq!(task.metadata.rdr_attempts, 4);
    }
}
