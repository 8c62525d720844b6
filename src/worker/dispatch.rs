//! Event dispatch layer: routes field changes to per-parent workers.
//!
//! The dispatcher resolves each field-change record to the parent task whose
//! aggregate it affects and enqueues a rollup command onto that parent's
//! worker queue. Different parents are processed fully concurrently; events
//! for a single parent are strictly serialized in arrival order.
//!
//! # Architecture
//!
//! ```text
//!                                        ┌──────────────────────────────┐
//!                                   ┌──► │   parent A queue (FIFO)      │ ──► worker A
//!                                   │    └──────────────────────────────┘
//! ┌─────────────┐   ┌───────────┐   │
//! │   axum      │──►│ dispatch  │───┤    ┌──────────────────────────────┐
//! │  (accepts)  │   │ by parent │   └──► │   parent B queue (FIFO)      │ ──► worker B
//! └─────────────┘   └───────────┘        └──────────────────────────────┘
//!       │ returns 200 immediately
//!       ▼
//! ```
//!
//! # Routing
//!
//! - AutoRollup toggle → the changed task is itself the parent; no remote
//!   call is needed to route.
//! - Contributing field → the changed task's parent is discovered with one
//!   Task Store read (the envelope does not reliably carry parent identity);
//!   a task without a parent is a no-op for the contribution path.
//! - Any other field → dropped with zero Task Store calls.
//!
//! # Worker Lifecycle
//!
//! Workers are created lazily when the first event for a parent arrives and
//! exit after a configurable idle interval. A send that races an idle exit
//! is retried against a freshly spawned worker, so no event is lost to
//! eviction. Stale handles are reaped by the background loop in [`Dispatcher::run`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::rollup::{FieldRole, RollupCommand, RollupEngine};
use crate::store::{StoreError, TaskStore};
use crate::types::{DeliveryId, TaskId, WorkspaceId};
use crate::webhooks::{FieldChangeRecord, WebhookEnvelope};

use super::message::WorkerMessage;
use super::worker::{run_worker, TaskWorker, WorkerConfig};

/// Errors that can occur during dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Parent discovery against the Task Store failed.
    #[error("parent discovery failed: {0}")]
    Store(#[from] StoreError),

    /// A worker queue stayed closed across a respawn.
    #[error("failed to send command to worker: channel closed")]
    ChannelClosed,
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a worker's queue may stay empty before the worker exits.
    pub idle_eviction: Duration,

    /// Bound on the duplicate-suppression window (delivery ids remembered).
    pub dedupe_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            idle_eviction: Duration::from_secs(300),
            dedupe_capacity: 4096,
        }
    }
}

/// Channel buffer size for worker queues.
const WORKER_CHANNEL_BUFFER: usize = 100;

/// Per-parent worker handle.
struct WorkerHandle {
    /// Channel for sending commands to the worker.
    tx: mpsc::Sender<WorkerMessage>,

    /// Handle to the worker's async task.
    #[allow(dead_code)]
    task: JoinHandle<()>,

    /// Cancellation token for this worker.
    cancel: CancellationToken,
}

/// Bounded first-in-first-out set of recently seen delivery ids.
///
/// The source may redeliver a webhook; remembering recent delivery ids keeps
/// redeliveries from being applied as fresh deltas. The bound keeps memory
/// flat; persistence of delivery history is a non-goal.
struct SeenDeliveries {
    order: VecDeque<DeliveryId>,
    set: HashSet<DeliveryId>,
    capacity: usize,
}

impl SeenDeliveries {
    fn new(capacity: usize) -> Self {
        SeenDeliveries {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a delivery id; returns `false` if it was already present.
    fn insert(&mut self, id: DeliveryId) -> bool {
        if self.set.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.set.insert(id);
        true
    }
}

/// Routes webhook envelopes to per-parent workers.
///
/// The dispatcher is thread-safe and shared across HTTP handler tasks. It is
/// the only concurrently-mutated shared structure in the core.
pub struct Dispatcher {
    config: DispatcherConfig,

    engine: Arc<RollupEngine>,

    /// Used for parent discovery only; all mutation goes through the engine.
    store: Arc<dyn TaskStore>,

    /// Active workers, keyed by parent task id.
    workers: RwLock<HashMap<TaskId, WorkerHandle>>,

    /// Recently seen delivery ids for duplicate suppression.
    seen: Mutex<SeenDeliveries>,

    /// Global shutdown token.
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    pub fn new(engine: Arc<RollupEngine>, store: Arc<dyn TaskStore>, config: DispatcherConfig) -> Self {
        Self::new_with_shutdown(engine, store, config, CancellationToken::new())
    }

    /// Creates a new dispatcher with a custom shutdown token.
    pub fn new_with_shutdown(
        engine: Arc<RollupEngine>,
        store: Arc<dyn TaskStore>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        info!(
            idle_eviction_secs = config.idle_eviction.as_secs(),
            "Creating dispatcher"
        );

        let seen = Mutex::new(SeenDeliveries::new(config.dedupe_capacity));
        Dispatcher {
            config,
            engine,
            store,
            workers: RwLock::new(HashMap::new()),
            seen,
            shutdown,
        }
    }

    /// Returns the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Processes one parsed webhook delivery.
    ///
    /// Duplicate deliveries are skipped wholesale. Each record is routed
    /// independently; a record that fails routing (e.g. parent discovery hit
    /// an unavailable Task Store) is logged and dropped without affecting
    /// the remaining records.
    #[instrument(skip(self, envelope), fields(delivery = %envelope.delivery, kind = ?envelope.kind))]
    pub async fn handle_envelope(&self, envelope: WebhookEnvelope) {
        let fresh = self
            .seen
            .lock()
            .expect("seen-deliveries lock poisoned")
            .insert(envelope.delivery.clone());
        if !fresh {
            debug!("Duplicate delivery skipped");
            return;
        }

        for record in &envelope.changes {
            if let Err(e) = self.route_record(&envelope.workspace, record).await {
                warn!(
                    task = %record.task,
                    field = %record.field,
                    before = ?record.before,
                    after = ?record.after,
                    error = %e,
                    "Dropping field change record"
                );
            }
        }
    }

    /// Resolves one record to a rollup command and enqueues it.
    async fn route_record(
        &self,
        workspace: &WorkspaceId,
        record: &FieldChangeRecord,
    ) -> Result<(), DispatchError> {
        match self.engine.fields().classify(&record.field) {
            FieldRole::AutoToggle => {
                // The toggle lives on the parent itself; route directly.
                self.enqueue(
                    workspace,
                    RollupCommand::Toggle {
                        task: record.task.clone(),
                        before: record.before.clone(),
                        after: record.after.clone(),
                    },
                )
                .await
            }
            FieldRole::Contributing => {
                // Conservative path: the envelope does not reliably carry
                // parent identity, so discover it with one read.
                let task = self.store.get_task(workspace, &record.task).await?;
                match task.parent {
                    Some(parent) => {
                        self.enqueue(
                            workspace,
                            RollupCommand::ChildDelta {
                                parent,
                                child: record.task.clone(),
                                before: record.before.clone(),
                                after: record.after.clone(),
                            },
                        )
                        .await
                    }
                    None => {
                        trace!(task = %record.task, "Top-level task, no parent contribution");
                        Ok(())
                    }
                }
            }
            FieldRole::Unrelated => {
                trace!(task = %record.task, field = %record.field, "Unrelated field ignored");
                Ok(())
            }
        }
    }

    /// Enqueues a command onto its parent's queue.
    ///
    /// A worker may exit via idle eviction between handle lookup and send;
    /// the send is retried once against a respawned worker.
    async fn enqueue(
        &self,
        workspace: &WorkspaceId,
        command: RollupCommand,
    ) -> Result<(), DispatchError> {
        let parent = command.parent().clone();
        let mut message = WorkerMessage::Command {
            workspace: workspace.clone(),
            command,
        };

        for _ in 0..2 {
            let tx = self.get_or_spawn_worker(&parent).await;
            match tx.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    debug!(parent = %parent, "Worker queue closed mid-send, respawning");
                    message = returned;
                    self.reap_worker(&parent).await;
                }
            }
        }

        Err(DispatchError::ChannelClosed)
    }

    /// Gets a live worker's sender or spawns a new worker task.
    async fn get_or_spawn_worker(&self, parent: &TaskId) -> mpsc::Sender<WorkerMessage> {
        // Fast path: existing live worker (read lock).
        {
            let workers = self.workers.read().await;
            if let Some(handle) = workers.get(parent) {
                if !handle.tx.is_closed() {
                    return handle.tx.clone();
                }
            }
        }

        let mut workers = self.workers.write().await;

        // Double-check after acquiring the write lock.
        if let Some(handle) = workers.get(parent) {
            if !handle.tx.is_closed() {
                return handle.tx.clone();
            }
            // Idle-evicted worker left a stale handle behind.
            workers.remove(parent);
        }

        debug!(parent = %parent, "Spawning worker");
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_BUFFER);
        let cancel = self.shutdown.child_token();
        let cancel_for_handle = cancel.clone();

        let worker = TaskWorker::new(
            WorkerConfig {
                task: parent.clone(),
                idle_eviction: self.config.idle_eviction,
            },
            self.engine.clone(),
        );
        let task = tokio::spawn(run_worker(worker, rx, cancel));

        workers.insert(
            parent.clone(),
            WorkerHandle {
                tx: tx.clone(),
                task,
                cancel: cancel_for_handle,
            },
        );

        tx
    }

    /// Removes a worker handle whose channel has closed.
    async fn reap_worker(&self, parent: &TaskId) {
        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.get(parent) {
            if handle.tx.is_closed() {
                workers.remove(parent);
            }
        }
    }

    /// Returns the number of tracked workers (live or awaiting reap).
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Checks if a live worker exists for the given parent.
    pub async fn has_live_worker(&self, parent: &TaskId) -> bool {
        self.workers
            .read()
            .await
            .get(parent)
            .is_some_and(|handle| !handle.tx.is_closed())
    }

    /// Sends a shutdown signal to all workers.
    pub async fn shutdown_all(&self) {
        info!("Shutting down all workers");
        self.shutdown.cancel();

        let workers = self.workers.read().await;
        for (parent, handle) in workers.iter() {
            trace!(parent = %parent, "Sending shutdown to worker");
            let _ = handle.tx.send(WorkerMessage::Shutdown).await;
            handle.cancel.cancel();
        }
    }

    /// Runs the dispatcher's background loop: periodic reaping of
    /// idle-evicted worker handles until shutdown.
    pub async fn run(&self) {
        info!("Dispatcher background loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_eviction) => {
                    self.reap_all_idle().await;
                }
            }
        }

        info!("Dispatcher shutdown signal received, stopping");
    }

    /// Drops every handle whose worker has exited.
    async fn reap_all_idle(&self) {
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|_, handle| !handle.tx.is_closed());
        let reaped = before - workers.len();
        if reaped > 0 {
            debug!(reaped, "Reaped idle workers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::RollupFields;
    use crate::test_utils::InMemoryTaskStore;
    use crate::types::FieldId;
    use crate::webhooks::EventKind;
    use serde_json::{json, Value};
    use std::time::Instant;

    fn fields() -> RollupFields {
        RollupFields::new(FieldId::new("f-auto"), FieldId::new("f-rollup"))
    }

    fn dispatcher(store: &Arc<InMemoryTaskStore>, config: DispatcherConfig) -> Dispatcher {
        let store_dyn = store.clone() as Arc<dyn TaskStore>;
        let engine = Arc::new(RollupEngine::new(store_dyn.clone(), fields()));
        Dispatcher::new(engine, store_dyn, config)
    }

    fn envelope(delivery: &str, changes: Vec<FieldChangeRecord>) -> WebhookEnvelope {
        WebhookEnvelope {
            kind: EventKind::TaskUpdated,
            workspace: WorkspaceId::new("900"),
            delivery: DeliveryId::new(delivery),
            changes,
        }
    }

    fn change(task: &str, field: &str, before: Value, after: Value) -> FieldChangeRecord {
        FieldChangeRecord {
            task: TaskId::new(task),
            field: FieldId::new(field),
            before,
            after,
        }
    }

    /// Polls until `predicate` holds or two seconds elapse.
    async fn wait_until(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn toggle_routes_to_the_task_itself() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("c1", json!(3)), ("c2", json!(5))]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("parent", "f-auto", json!(false), json!(true))],
            ))
            .await;

        wait_until(|| store.writes() == 1).await;
        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(8)));
        assert!(dispatcher.has_live_worker(&TaskId::new("parent")).await);
    }

    #[tokio::test]
    async fn contributing_change_routes_via_parent_discovery() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(9))]);
        store.set_field_raw("parent", "f-auto", json!(true));
        store.set_field_raw("parent", "f-rollup", json!(8));

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("child", "f-rollup", json!(5), json!(9))],
            ))
            .await;

        wait_until(|| store.writes() == 1).await;
        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(12)));
        // The queue is keyed by the parent, not the child.
        assert!(dispatcher.has_live_worker(&TaskId::new("parent")).await);
        assert!(!dispatcher.has_live_worker(&TaskId::new("child")).await);
    }

    #[tokio::test]
    async fn top_level_task_contribution_is_a_no_op() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("solo", &[]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("solo", "f-rollup", json!(1), json!(2))],
            ))
            .await;

        // One read for parent discovery, then nothing.
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 0);
        assert_eq!(dispatcher.worker_count().await, 0);
    }

    /// An unrelated field produces zero Task Store calls.
    #[tokio::test]
    async fn unrelated_field_produces_zero_store_calls() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(1))]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("child", "f-unrelated", json!("a"), json!("b"))],
            ))
            .await;

        assert_eq!(store.reads(), 0);
        assert_eq!(store.writes(), 0);
        assert_eq!(dispatcher.worker_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(9))]);
        store.set_field_raw("parent", "f-auto", json!(true));
        store.set_field_raw("parent", "f-rollup", json!(8));

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        let delta = envelope("same-id", vec![change("child", "f-rollup", json!(5), json!(9))]);

        dispatcher.handle_envelope(delta.clone()).await;
        wait_until(|| store.writes() == 1).await;

        // Redelivery with the same delivery id must not re-apply the delta.
        dispatcher.handle_envelope(delta).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.writes(), 1);
        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(12)));
    }

    /// Two concurrent deltas for one parent are serialized; the second
    /// observes the first's write and no update is lost.
    #[tokio::test]
    async fn concurrent_deltas_for_one_parent_do_not_lose_updates() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("c1", json!(4)), ("c2", json!(1))]);
        store.set_field_raw("parent", "f-auto", json!(true));
        store.set_field_raw("parent", "f-rollup", json!(8));
        // Widen the read-modify-write window: an unserialized pair would
        // both read 8 and one increment would be lost.
        store.set_read_delay(Duration::from_millis(50));

        let dispatcher = Arc::new(dispatcher(&store, DispatcherConfig::default()));

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle_envelope(envelope(
                        "d1",
                        vec![change("c1", "f-rollup", json!(0), json!(4))],
                    ))
                    .await;
            })
        };
        let second = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle_envelope(envelope(
                        "d2",
                        vec![change("c2", "f-rollup", json!(0), json!(1))],
                    ))
                    .await;
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        wait_until(|| store.writes() == 2).await;

        assert_eq!(
            store.field_value("parent", "f-rollup"),
            Some(json!(13)),
            "both deltas applied, no lost update"
        );
    }

    #[tokio::test]
    async fn distinct_parents_get_distinct_workers() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent-a", &[("a1", json!(1))]);
        store.insert_parent("parent-b", &[("b1", json!(2))]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![
                    change("parent-a", "f-auto", json!(false), json!(true)),
                    change("parent-b", "f-auto", json!(false), json!(true)),
                ],
            ))
            .await;

        wait_until(|| store.writes() == 2).await;
        assert_eq!(dispatcher.worker_count().await, 2);
        assert_eq!(store.field_value("parent-a", "f-rollup"), Some(json!(1)));
        assert_eq!(store.field_value("parent-b", "f-rollup"), Some(json!(2)));
    }

    #[tokio::test]
    async fn failed_parent_discovery_drops_only_that_record() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(0))]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![
                    // Unknown task: discovery 404s, record dropped.
                    change("ghost", "f-rollup", json!(0), json!(1)),
                    // Valid toggle still processed.
                    change("parent", "f-auto", json!(false), json!(true)),
                ],
            ))
            .await;

        wait_until(|| store.writes() == 1).await;
        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(0)));
    }

    #[tokio::test]
    async fn evicted_worker_is_respawned_on_next_event() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("c1", json!(2))]);

        let config = DispatcherConfig {
            idle_eviction: Duration::from_millis(20),
            ..DispatcherConfig::default()
        };
        let dispatcher = dispatcher(&store, config);

        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("parent", "f-auto", json!(false), json!(true))],
            ))
            .await;
        wait_until(|| store.writes() == 1).await;

        // Let the worker idle out.
        let parent = TaskId::new("parent");
        let deadline = Instant::now() + Duration::from_secs(2);
        while dispatcher.has_live_worker(&parent).await {
            assert!(Instant::now() < deadline, "worker did not idle out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Next event respawns a worker and still applies.
        dispatcher
            .handle_envelope(envelope(
                "d2",
                vec![change("parent", "f-auto", json!(true), json!(false))],
            ))
            .await;
        wait_until(|| store.writes() == 2).await;
        assert_eq!(store.field_value("parent", "f-rollup"), Some(Value::Null));
    }

    #[tokio::test]
    async fn shutdown_all_cancels_workers() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("c1", json!(1))]);

        let dispatcher = dispatcher(&store, DispatcherConfig::default());
        dispatcher
            .handle_envelope(envelope(
                "d1",
                vec![change("parent", "f-auto", json!(false), json!(true))],
            ))
            .await;
        wait_until(|| store.writes() == 1).await;

        assert!(!dispatcher.shutdown_token().is_cancelled());
        dispatcher.shutdown_all().await;
        assert!(dispatcher.shutdown_token().is_cancelled());

        let parent = TaskId::new("parent");
        let deadline = Instant::now() + Duration::from_secs(2);
        while dispatcher.has_live_worker(&parent).await {
            assert!(Instant::now() < deadline, "worker did not stop after shutdown");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn seen_deliveries_bounded_eviction() {
        let mut seen = SeenDeliveries::new(2);
        assert!(seen.insert(DeliveryId::new("a")));
        assert!(seen.insert(DeliveryId::new("b")));
        assert!(!seen.insert(DeliveryId::new("a")));

        // Inserting a third evicts the oldest.
        assert!(seen.insert(DeliveryId::new("c")));
        assert!(seen.insert(DeliveryId::new("a")), "evicted id is forgotten");
    }
}
