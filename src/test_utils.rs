//! Shared test doubles.
//!
//! [`InMemoryTaskStore`] stands in for the remote Task Store in engine,
//! dispatcher, and server tests. It counts reads and writes (several spec
//! properties are phrased as "zero Task Store calls"), can delay reads to
//! widen race windows in serialization tests, and can fail writes on demand.
//!
//! By convention tasks get their contributing value in field `f-rollup` and
//! their toggle in `f-auto`, matching the `RollupFields` used by the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::{StoreError, TaskStore, WebhookRegistration};
use crate::types::{CustomField, FieldId, Task, TaskId, WorkspaceId};
use crate::webhooks::EventKind;

/// In-memory Task Store fake.
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    webhooks: Mutex<Vec<WebhookRegistration>>,
    reads: AtomicU32,
    writes: AtomicU32,
    failing_writes: AtomicU32,
    read_delay: Mutex<Option<Duration>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        InMemoryTaskStore {
            tasks: Mutex::new(HashMap::new()),
            webhooks: Mutex::new(Vec::new()),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            read_delay: Mutex::new(None),
        }
    }

    /// Inserts a task as-is.
    pub fn insert_task(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    /// Inserts a parent and its children, each child carrying the given
    /// contributing value in field `f-rollup`.
    pub fn insert_parent(&self, parent: &str, children: &[(&str, Value)]) {
        let parent_id = TaskId::new(parent);
        self.insert_task(Task {
            id: parent_id.clone(),
            parent: None,
            custom_fields: Vec::new(),
            subtasks: Vec::new(),
        });
        for (child, value) in children {
            self.insert_task(Task {
                id: TaskId::new(*child),
                parent: Some(parent_id.clone()),
                custom_fields: vec![CustomField {
                    id: FieldId::new("f-rollup"),
                    name: String::new(),
                    value: value.clone(),
                }],
                subtasks: Vec::new(),
            });
        }
    }

    /// Sets a field directly, without counting as a store write.
    pub fn set_field_raw(&self, task: &str, field: &str, value: Value) {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&TaskId::new(task))
            .expect("task must be inserted first");
        upsert_field(task, &FieldId::new(field), value);
    }

    /// Reads a field back, or `None` if the task or field is absent.
    pub fn field_value(&self, task: &str, field: &str) -> Option<Value> {
        let tasks = self.tasks.lock().unwrap();
        let task = tasks.get(&TaskId::new(task))?;
        task.field(&FieldId::new(field)).map(|f| f.value.clone())
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next `n` writes fail with `UpstreamUnavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Delays every read by `delay`, widening race windows in
    /// serialization tests.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    async fn apply_read_delay(&self) {
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot of a task with its subtasks assembled from parent pointers.
    fn assemble(&self, task: &TaskId) -> Option<Task> {
        let tasks = self.tasks.lock().unwrap();
        let mut found = tasks.get(task)?.clone();
        found.subtasks = tasks
            .values()
            .filter(|t| t.parent.as_ref() == Some(task))
            .cloned()
            .collect();
        Some(found)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert_field(task: &mut Task, field: &FieldId, value: Value) {
    match task.custom_fields.iter_mut().find(|f| &f.id == field) {
        Some(existing) => existing.value = value,
        None => task.custom_fields.push(CustomField {
            id: field.clone(),
            name: String::new(),
            value,
        }),
    }
}

fn not_found(task: &TaskId) -> StoreError {
    StoreError::RemoteRejected {
        status: 404,
        body: format!("task {task} not found"),
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, _workspace: &WorkspaceId, task: &TaskId) -> Result<Task, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.apply_read_delay().await;
        self.assemble(task).ok_or_else(|| not_found(task))
    }

    async fn get_children(
        &self,
        _workspace: &WorkspaceId,
        task: &TaskId,
    ) -> Result<Vec<Task>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.apply_read_delay().await;
        self.assemble(task)
            .map(|t| t.subtasks)
            .ok_or_else(|| not_found(task))
    }

    async fn set_field(
        &self,
        _workspace: &WorkspaceId,
        task: &TaskId,
        field: &FieldId,
        value: Value,
    ) -> Result<(), StoreError> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::UpstreamUnavailable {
                status: Some(503),
                message: "injected write failure".to_string(),
            });
        }

        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task).ok_or_else(|| not_found(task))?;
        upsert_field(task, field, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_webhook(
        &self,
        _workspace: &WorkspaceId,
        endpoint: &str,
        events: &[EventKind],
    ) -> Result<WebhookRegistration, StoreError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        let registration = WebhookRegistration {
            id: format!("wh-{}", webhooks.len() + 1),
            endpoint: endpoint.to_string(),
            events: events.iter().map(|e| e.as_str().to_string()).collect(),
        };
        webhooks.push(registration.clone());
        Ok(registration)
    }

    async fn list_webhooks(
        &self,
        _workspace: &WorkspaceId,
    ) -> Result<Vec<WebhookRegistration>, StoreError> {
        Ok(self.webhooks.lock().unwrap().clone())
    }
}
