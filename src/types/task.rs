//! Task and custom-field types, with the value coercion rules.
//!
//! Tasks are owned by the remote Task Store; the core only ever holds
//! ephemeral reads. Custom-field values arrive as loosely-typed JSON (the
//! remote API reports numbers as strings in some payloads), so all numeric
//! interpretation goes through [`numeric`] and all toggle interpretation goes
//! through [`truthy`], never ad hoc casts at call sites.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{FieldId, TaskId};

/// A custom field on a task.
///
/// Identity is the `id`; the `name` is carried only for log readability and
/// must never drive behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: FieldId,
    #[serde(default)]
    pub name: String,
    /// Raw value as reported by the remote API. Absent fields deserialize to
    /// `Value::Null`.
    #[serde(default)]
    pub value: Value,
}

/// An ephemeral read of a task from the Task Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// The owning task, or `None` for top-level tasks.
    #[serde(default)]
    pub parent: Option<TaskId>,

    #[serde(default)]
    pub custom_fields: Vec<CustomField>,

    /// Direct children, populated when the task was fetched with subtasks
    /// included.
    #[serde(default)]
    pub subtasks: Vec<Task>,
}

impl Task {
    /// Looks up a custom field by id.
    pub fn field(&self, id: &FieldId) -> Option<&CustomField> {
        self.custom_fields.iter().find(|f| &f.id == id)
    }

    /// Returns the raw value of a field, or `Null` when the field is absent.
    pub fn field_value(&self, id: &FieldId) -> &Value {
        self.field(id).map(|f| &f.value).unwrap_or(&Value::Null)
    }
}

/// Coerces a field value to a number.
///
/// The remote API is inconsistent about value types: numeric custom fields
/// arrive as JSON numbers in some payloads and as strings in others. The
/// rules here are deliberate and load-bearing for the rollup arithmetic:
///
/// - JSON numbers pass through
/// - strings are parsed as f64 (after trimming); unparseable or empty → 0
/// - null, booleans, arrays, objects → 0
pub fn numeric(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Interprets a field value as a boolean toggle.
///
/// The AutoRollup flag arrives as JSON `true`/`false` from some payloads and
/// as `"true"`/`"false"`/`"1"`/`"0"` strings from others. Absent and null are
/// disabled.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim(), "true" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_with_fields(fields: Vec<(&str, Value)>) -> Task {
        Task {
            id: TaskId::new("t1"),
            parent: None,
            custom_fields: fields
                .into_iter()
                .map(|(id, value)| CustomField {
                    id: FieldId::new(id),
                    name: String::new(),
                    value,
                })
                .collect(),
            subtasks: Vec::new(),
        }
    }

    #[test]
    fn field_lookup_is_by_id_not_name() {
        let task = Task {
            id: TaskId::new("t1"),
            parent: None,
            custom_fields: vec![CustomField {
                id: FieldId::new("f-1"),
                name: "Auto Rollup".to_string(),
                value: json!(true),
            }],
            subtasks: Vec::new(),
        };

        assert!(task.field(&FieldId::new("f-1")).is_some());
        // A lookup using the display name as an id must fail.
        assert!(task.field(&FieldId::new("Auto Rollup")).is_none());
    }

    #[test]
    fn field_value_absent_is_null() {
        let task = task_with_fields(vec![]);
        assert_eq!(task.field_value(&FieldId::new("missing")), &Value::Null);
    }

    #[test]
    fn numeric_passes_numbers_through() {
        assert_eq!(numeric(&json!(3)), 3.0);
        assert_eq!(numeric(&json!(2.5)), 2.5);
        assert_eq!(numeric(&json!(-4)), -4.0);
    }

    #[test]
    fn numeric_parses_strings() {
        assert_eq!(numeric(&json!("12")), 12.0);
        assert_eq!(numeric(&json!("3.5")), 3.5);
        assert_eq!(numeric(&json!(" 7 ")), 7.0);
    }

    #[test]
    fn numeric_treats_garbage_as_zero() {
        assert_eq!(numeric(&json!("")), 0.0);
        assert_eq!(numeric(&json!("abc")), 0.0);
        assert_eq!(numeric(&Value::Null), 0.0);
        assert_eq!(numeric(&json!(true)), 0.0);
        assert_eq!(numeric(&json!([1, 2])), 0.0);
        assert_eq!(numeric(&json!({"v": 1})), 0.0);
    }

    #[test]
    fn truthy_accepts_bool_and_string_forms() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("true")));
        assert!(truthy(&json!("1")));
        assert!(truthy(&json!(1)));
    }

    #[test]
    fn truthy_rejects_disabled_forms() {
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&json!("0")));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: Task = serde_json::from_value(json!({"id": "abc"})).unwrap();
        assert_eq!(task.id, TaskId::new("abc"));
        assert!(task.parent.is_none());
        assert!(task.custom_fields.is_empty());
        assert!(task.subtasks.is_empty());
    }

    #[test]
    fn task_deserializes_nested_subtasks() {
        let task: Task = serde_json::from_value(json!({
            "id": "parent",
            "custom_fields": [{"id": "f-1", "name": "Rollup", "value": "8"}],
            "subtasks": [
                {"id": "child-1", "parent": "parent",
                 "custom_fields": [{"id": "f-1", "value": 3}]},
                {"id": "child-2", "parent": "parent"}
            ]
        }))
        .unwrap();

        assert_eq!(task.subtasks.len(), 2);
        assert_eq!(task.subtasks[0].parent, Some(TaskId::new("parent")));
        assert_eq!(numeric(task.field_value(&FieldId::new("f-1"))), 8.0);
    }
}
