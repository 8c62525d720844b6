//! Core domain types.

pub mod ids;
pub mod task;

pub use ids::{DeliveryId, FieldId, TaskId, WorkspaceId};
pub use task::{numeric, truthy, CustomField, Task};
