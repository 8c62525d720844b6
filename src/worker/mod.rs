//! Per-parent serialization: dispatcher and worker event loops.
//!
//! This is the concurrency discipline of the whole service: an arbitrary
//! number of events run concurrently across distinct parent tasks, while
//! each parent's events flow through its own single worker in arrival order.

pub mod dispatch;
pub mod message;
pub mod worker;

pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig};
pub use message::WorkerMessage;
pub use worker::{TaskWorker, WorkerConfig};
