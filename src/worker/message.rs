//! Worker message types for async communication.
//!
//! Each per-parent worker receives these messages via `tokio::sync::mpsc`
//! and processes them serially, which is what upholds the single-writer
//! discipline for that parent.

use crate::rollup::RollupCommand;
use crate::types::WorkspaceId;

/// Messages that can be sent to a per-parent worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A rollup command to apply.
    ///
    /// The workspace travels with the command because credentials are
    /// resolved per call through the Auth Provider, never cached in the
    /// worker.
    Command {
        workspace: WorkspaceId,
        command: RollupCommand,
    },

    /// Request a graceful shutdown.
    ///
    /// The worker finishes the in-flight command and exits its event loop.
    Shutdown,
}
