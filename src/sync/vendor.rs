//! Vendor-specific snapshot and diff modifiers.
//!
//! Some databases describe the same structure differently (a Postgres serial
//! column shows up as a `nextval(...)` default). Modifiers normalize
//! snapshots on export and clean up diffs on import so that equivalent
//! schemas do not produce spurious changes.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::sync::service::{DiffKind, Snapshot, SnapshotDiff};

/// Rewrites a snapshot before it is written to disk.
pub type SnapshotModifier = fn(Snapshot) -> Snapshot;

/// Rewrites a diff before it is applied.
pub type DiffModifier = fn(SnapshotDiff) -> SnapshotDiff;

/// Ordered modifier lists keyed by vendor name.
#[derive(Debug, Clone, Default)]
pub struct ModifierRegistry {
    export: HashMap<String, Vec<SnapshotModifier>>,
    import: HashMap<String, Vec<DiffModifier>>,
}

impl ModifierRegistry {
    /// Registry with no modifiers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in modifiers.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.on_export("postgres", sequence_to_serial_type);
        registry.on_import("postgres", strip_nextval_defaults);
        registry
    }

    pub fn on_export(&mut self, vendor: &str, modifier: SnapshotModifier) {
        self.export.entry(vendor.to_string()).or_default().push(modifier);
    }

    pub fn on_import(&mut self, vendor: &str, modifier: DiffModifier) {
        self.import.entry(vendor.to_string()).or_default().push(modifier);
    }

    /// Run the export modifiers registered for the snapshot's vendor.
    #[must_use]
    pub fn apply_export(&self, snapshot: Snapshot) -> Snapshot {
        let Some(modifiers) = self.export.get(&snapshot.vendor) else {
            return snapshot;
        };
        debug!(vendor = %snapshot.vendor, count = modifiers.len(), "Applying export modifiers");
        modifiers.iter().fold(snapshot, |acc, modifier| modifier(acc))
    }

    /// Run the import modifiers registered for `vendor`.
    #[must_use]
    pub fn apply_import(&self, vendor: &str, diff: SnapshotDiff) -> SnapshotDiff {
        let Some(modifiers) = self.import.get(vendor) else {
            return diff;
        };
        debug!(vendor, count = modifiers.len(), "Applying import modifiers");
        modifiers.iter().fold(diff, |acc, modifier| modifier(acc))
    }
}

/// `nextval('<table>_<column>_seq'::regclass)` for a field schema, if that
/// is what its default is.
fn is_own_sequence(schema: &Value, default: &Value) -> bool {
    let (Some(table), Some(name), Some(default)) = (
        schema.get("table").and_then(Value::as_str),
        schema.get("name").and_then(Value::as_str),
        default.as_str(),
    ) else {
        return false;
    };
    default == format!("nextval('{table}_{name}_seq'::regclass)")
}

fn mark_auto_increment(schema: &mut Value) {
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("default_value".into(), Value::Null);
        obj.insert("has_auto_increment".into(), Value::Bool(true));
    }
}

/// Replace a field's own-sequence default with the auto-increment flag.
#[must_use]
pub fn sequence_to_serial_type(mut snapshot: Snapshot) -> Snapshot {
    for field in &mut snapshot.fields {
        let Some(schema) = field.schema.as_mut() else {
            continue;
        };
        let own = schema
            .get("default_value")
            .is_some_and(|default| is_own_sequence(schema, default));
        if own {
            mark_auto_increment(schema);
        }
    }
    snapshot
}

fn is_nextval(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|s| s.starts_with("nextval("))
}

/// Drop edits that only set a `nextval(...)` default and turn new fields
/// carrying one into auto-increment fields.
#[must_use]
pub fn strip_nextval_defaults(mut diff: SnapshotDiff) -> SnapshotDiff {
    for entry in &mut diff.fields {
        entry.diff.retain(|op| {
            !(op.kind == DiffKind::E
                && op.path == ["schema", "default_value"]
                && is_nextval(op.rhs.as_ref()))
        });

        for op in &mut entry.diff {
            if op.kind != DiffKind::N {
                continue;
            }
            let Some(schema) = op.rhs.as_mut().and_then(|rhs| rhs.get_mut("schema")) else {
                continue;
            };
            if is_nextval(schema.get("default_value")) {
                mark_auto_increment(schema);
            }
        }
    }
    diff
}
