//! Rollup maintenance: the state machine reacting to field changes.

pub mod engine;

pub use engine::{
    rollup_state, FieldRole, Outcome, RollupCommand, RollupEngine, RollupFields, RollupState,
};
