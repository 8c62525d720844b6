//! The rollup state machine.
//!
//! Each parent task is implicitly in one of two states, recomputed from
//! remote reads on demand; nothing is persisted locally:
//!
//! - `Enabled`: the AutoRollup toggle is set; the RollupValue field must
//!   track the sum of the children's contributing field.
//! - `Disabled`: the toggle is off or absent; the RollupValue field is left
//!   alone and child changes are ignored.
//!
//! # Transition table
//!
//! | Command | State | Action |
//! |---|---|---|
//! | `Toggle` to on | any | full recompute: sum children, write total |
//! | `Toggle` to off | any | write RollupValue = null |
//! | `ChildDelta` | `Enabled` | write `current + (after - before)` |
//! | `ChildDelta` | `Disabled` | no write |
//!
//! Acting on the toggle's `after` value alone (rather than the before/after
//! pair) makes both toggle transitions idempotent under redelivery: a second
//! toggle-off clears an already-null value, a second toggle-on recomputes the
//! same total.
//!
//! Every transition issues at most one write, so a Task Store failure can
//! never leave a transition half-applied; the failed event is logged with
//! full context by the worker and later events proceed.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::store::{StoreError, TaskStore};
use crate::types::{numeric, truthy, FieldId, Task, TaskId, WorkspaceId};

/// The per-deployment field configuration.
///
/// Field ids are injected; nothing in the engine ever matches on a field's
/// display name.
#[derive(Debug, Clone)]
pub struct RollupFields {
    /// The AutoRollup boolean toggle.
    pub auto: FieldId,

    /// The RollupValue numeric aggregate on the parent.
    pub value: FieldId,

    /// The contributing field summed across children. Defaults to the
    /// RollupValue field, so rollups nest across levels.
    pub source: FieldId,
}

impl RollupFields {
    pub fn new(auto: FieldId, value: FieldId) -> Self {
        let source = value.clone();
        RollupFields {
            auto,
            value,
            source,
        }
    }

    /// Overrides the contributing field summed across children.
    pub fn with_source(mut self, source: FieldId) -> Self {
        self.source = source;
        self
    }

    /// Classifies a changed field for routing.
    pub fn classify(&self, field: &FieldId) -> FieldRole {
        if field == &self.auto {
            FieldRole::AutoToggle
        } else if field == &self.source {
            FieldRole::Contributing
        } else {
            FieldRole::Unrelated
        }
    }
}

/// What a changed field means to the rollup machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// The AutoRollup toggle on a (potential) parent.
    AutoToggle,

    /// The contributing field on a (potential) child.
    Contributing,

    /// Neither; the event is dropped without any Task Store call.
    Unrelated,
}

/// Rollup maintenance state of a parent, derived from a remote read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupState {
    Enabled,
    Disabled,
}

/// Derives the rollup state of a task from its AutoRollup field.
pub fn rollup_state(task: &Task, fields: &RollupFields) -> RollupState {
    if truthy(task.field_value(&fields.auto)) {
        RollupState::Enabled
    } else {
        RollupState::Disabled
    }
}

/// A unit of rollup work, routed to the parent task's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RollupCommand {
    /// The AutoRollup toggle changed on `task` itself.
    Toggle {
        task: TaskId,
        before: Value,
        after: Value,
    },

    /// The contributing field changed on a child of `parent`.
    ChildDelta {
        parent: TaskId,
        child: TaskId,
        before: Value,
        after: Value,
    },
}

impl RollupCommand {
    /// The parent task whose queue serializes this command.
    pub fn parent(&self) -> &TaskId {
        match self {
            RollupCommand::Toggle { task, .. } => task,
            RollupCommand::ChildDelta { parent, .. } => parent,
        }
    }
}

/// What a transition did, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Full recompute: the children's contributing fields were summed.
    Recomputed { total: f64, children: usize },

    /// RollupValue was cleared on toggle-off.
    Cleared,

    /// Incremental adjustment from a child delta.
    Adjusted { from: f64, to: f64 },

    /// No write was needed (rollup disabled on the parent).
    Skipped,
}

/// Executes rollup transitions against the Task Store.
///
/// The engine holds no mutable state and no credentials; serialization of
/// commands targeting the same parent is the Dispatcher's responsibility.
pub struct RollupEngine {
    store: Arc<dyn TaskStore>,
    fields: RollupFields,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn TaskStore>, fields: RollupFields) -> Self {
        RollupEngine { store, fields }
    }

    pub fn fields(&self) -> &RollupFields {
        &self.fields
    }

    /// Applies one command. At most one Task Store write is issued.
    pub async fn apply(
        &self,
        workspace: &WorkspaceId,
        command: &RollupCommand,
    ) -> Result<Outcome, StoreError> {
        match command {
            RollupCommand::Toggle { task, after, .. } => {
                if truthy(after) {
                    self.recompute(workspace, task).await
                } else {
                    self.clear(workspace, task).await
                }
            }
            RollupCommand::ChildDelta {
                parent,
                child,
                before,
                after,
            } => self.adjust(workspace, parent, child, before, after).await,
        }
    }

    /// Toggle-on: sum the contributing field across all direct children and
    /// write the total. Absent values count as zero.
    async fn recompute(
        &self,
        workspace: &WorkspaceId,
        parent: &TaskId,
    ) -> Result<Outcome, StoreError> {
        let children = self.store.get_children(workspace, parent).await?;
        let total: f64 = children
            .iter()
            .map(|child| numeric(child.field_value(&self.fields.source)))
            .sum();

        self.store
            .set_field(workspace, parent, &self.fields.value, number_value(total))
            .await?;

        info!(
            parent = %parent,
            total,
            children = children.len(),
            "Rollup enabled, recomputed from children"
        );
        Ok(Outcome::Recomputed {
            total,
            children: children.len(),
        })
    }

    /// Toggle-off: clear the aggregate.
    async fn clear(&self, workspace: &WorkspaceId, parent: &TaskId) -> Result<Outcome, StoreError> {
        self.store
            .set_field(workspace, parent, &self.fields.value, Value::Null)
            .await?;

        info!(parent = %parent, "Rollup disabled, cleared value");
        Ok(Outcome::Cleared)
    }

    /// Child delta: re-read the parent, and only if rollup is still enabled
    /// apply the numeric difference.
    async fn adjust(
        &self,
        workspace: &WorkspaceId,
        parent: &TaskId,
        child: &TaskId,
        before: &Value,
        after: &Value,
    ) -> Result<Outcome, StoreError> {
        let parent_task = self.store.get_task(workspace, parent).await?;

        if rollup_state(&parent_task, &self.fields) == RollupState::Disabled {
            debug!(parent = %parent, child = %child, "Rollup disabled on parent, ignoring child change");
            return Ok(Outcome::Skipped);
        }

        let current = numeric(parent_task.field_value(&self.fields.value));
        let delta = numeric(after) - numeric(before);
        let updated = current + delta;

        if updated < 0.0 {
            // A live rollup can only go negative through bad inputs (e.g. a
            // bogus `before` on a redelivered event). Write what the
            // arithmetic says and make it loud; silently clamping would hide
            // the corruption.
            error!(
                parent = %parent,
                child = %child,
                current,
                delta,
                updated,
                "Rollup value went negative; writing as computed"
            );
        }

        self.store
            .set_field(workspace, parent, &self.fields.value, number_value(updated))
            .await?;

        info!(
            parent = %parent,
            child = %child,
            from = current,
            to = updated,
            "Rollup adjusted for child change"
        );
        Ok(Outcome::Adjusted {
            from: current,
            to: updated,
        })
    }
}

/// Renders a computed total as JSON, preferring integers for whole numbers
/// so the remote field shows `8` rather than `8.0`.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
