//! Per-parent event loop for applying rollup commands.
//!
//! Each parent task with in-flight work gets a dedicated worker that applies
//! commands strictly in arrival order. Because a rollup update is a
//! read-then-write round trip with no transactional guard on the remote
//! side, this serialization is what prevents two concurrent deliveries from
//! both reading a stale aggregate and losing one update.
//!
//! Workers are cheap: an mpsc receiver and a tokio task. A worker whose
//! queue stays empty for the configured idle interval exits; the Dispatcher
//! respawns one on the next event for that parent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::rollup::{RollupCommand, RollupEngine};
use crate::types::{TaskId, WorkspaceId};

use super::message::WorkerMessage;

/// Configuration for a per-parent worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The parent task this worker serializes.
    pub task: TaskId,

    /// How long the queue may stay empty before the worker exits.
    pub idle_eviction: Duration,
}

/// Worker applying rollup commands for a single parent task.
pub struct TaskWorker {
    config: WorkerConfig,
    engine: Arc<RollupEngine>,
}

impl TaskWorker {
    pub fn new(config: WorkerConfig, engine: Arc<RollupEngine>) -> Self {
        TaskWorker { config, engine }
    }

    /// Runs the event loop until shutdown, an explicit `Shutdown` message,
    /// channel closure, or idle eviction.
    pub async fn run(self, mut rx: mpsc::Receiver<WorkerMessage>, cancel: CancellationToken) {
        enum Next {
            Cancelled,
            Message(Option<WorkerMessage>),
            Idle,
        }

        debug!(task = %self.config.task, "Worker started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Cancelled,
                message = rx.recv() => Next::Message(message),
                _ = tokio::time::sleep(self.config.idle_eviction) => Next::Idle,
            };

            match next {
                Next::Cancelled => {
                    debug!(task = %self.config.task, "Worker cancelled");
                    break;
                }
                Next::Message(Some(WorkerMessage::Command { workspace, command })) => {
                    self.process(&workspace, &command).await;
                }
                Next::Message(Some(WorkerMessage::Shutdown)) | Next::Message(None) => {
                    debug!(task = %self.config.task, "Worker shutting down");
                    break;
                }
                Next::Idle => {
                    // Close the queue first so a send racing this timer fails
                    // over to a respawned worker, then drain anything that
                    // was already buffered. Nothing may be lost to eviction.
                    rx.close();
                    while let Ok(message) = rx.try_recv() {
                        if let WorkerMessage::Command { workspace, command } = message {
                            self.process(&workspace, &command).await;
                        }
                    }
                    debug!(task = %self.config.task, "Worker idle, evicting");
                    break;
                }
            }
        }
    }

    /// Applies one command, containing any failure to this event.
    ///
    /// A failed transition is logged with full context and dropped; it must
    /// not poison later events for this parent or any other parent. The
    /// Task Store client has already exhausted its own retry budget by the
    /// time an error reaches here.
    async fn process(&self, workspace: &WorkspaceId, command: &RollupCommand) {
        match self.engine.apply(workspace, command).await {
            Ok(outcome) => {
                debug!(task = %self.config.task, outcome = ?outcome, "Command applied");
            }
            Err(e) => {
                error!(
                    task = %self.config.task,
                    workspace = %workspace,
                    command = ?command,
                    error = %e,
                    "Rollup transition failed; event dropped"
                );
            }
        }
    }
}

/// Logs worker start/stop transitions at info level for operators.
///
/// Kept separate from `run` so the dispatcher can wrap the future without
/// duplicating the logging.
pub async fn run_worker(
    worker: TaskWorker,
    rx: mpsc::Receiver<WorkerMessage>,
    cancel: CancellationToken,
) {
    let task = worker.config.task.clone();
    worker.run(rx, cancel).await;
    info!(task = %task, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::RollupFields;
    use crate::store::TaskStore;
    use crate::test_utils::InMemoryTaskStore;
    use crate::types::FieldId;
    use serde_json::json;

    fn engine(store: &Arc<InMemoryTaskStore>) -> Arc<RollupEngine> {
        Arc::new(RollupEngine::new(
            store.clone() as Arc<dyn TaskStore>,
            RollupFields::new(FieldId::new("f-auto"), FieldId::new("f-rollup")),
        ))
    }

    fn command(parent: &str, before: serde_json::Value, after: serde_json::Value) -> WorkerMessage {
        WorkerMessage::Command {
            workspace: WorkspaceId::new("900"),
            command: RollupCommand::ChildDelta {
                parent: TaskId::new(parent),
                child: TaskId::new("child"),
                before,
                after,
            },
        }
    }

    fn spawn_worker(
        store: &Arc<InMemoryTaskStore>,
        idle: Duration,
    ) -> (mpsc::Sender<WorkerMessage>, tokio::task::JoinHandle<()>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = TaskWorker::new(
            WorkerConfig {
                task: TaskId::new("parent"),
                idle_eviction: idle,
            },
            engine(store),
        );
        let handle = tokio::spawn(run_worker(worker, rx, cancel.clone()));
        (tx, handle, cancel)
    }

    #[tokio::test]
    async fn processes_commands_in_order() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(0))]);
        store.set_field_raw("parent", "f-auto", json!(true));
        store.set_field_raw("parent", "f-rollup", json!(0));

        let (tx, handle, _cancel) = spawn_worker(&store, Duration::from_secs(30));

        tx.send(command("parent", json!(0), json!(4))).await.unwrap();
        tx.send(command("parent", json!(4), json!(9))).await.unwrap();
        tx.send(WorkerMessage::Shutdown).await.unwrap();
        handle.await.unwrap();

        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(9)));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn failed_event_does_not_block_the_next() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert_parent("parent", &[("child", json!(0))]);
        store.set_field_raw("parent", "f-auto", json!(true));
        store.set_field_raw("parent", "f-rollup", json!(0));
        store.fail_next_writes(1);

        let (tx, handle, _cancel) = spawn_worker(&store, Duration::from_secs(30));

        // First command's write fails and is dropped; second still applies.
        tx.send(command("parent", json!(0), json!(100))).await.unwrap();
        tx.send(command("parent", json!(0), json!(5))).await.unwrap();
        tx.send(WorkerMessage::Shutdown).await.unwrap();
        handle.await.unwrap();

        assert_eq!(store.field_value("parent", "f-rollup"), Some(json!(5)));
    }

    #[tokio::test]
    async fn exits_on_idle_timeout() {
        let store = Arc::new(InMemoryTaskStore::new());
        let (tx, handle, _cancel) = spawn_worker(&store, Duration::from_millis(20));

        handle.await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn exits_on_cancellation() {
        let store = Arc::new(InMemoryTaskStore::new());
        let (_tx, handle, cancel) = spawn_worker(&store, Duration::from_secs(30));

        cancel.cancel();
        handle.await.unwrap();
    }
}
