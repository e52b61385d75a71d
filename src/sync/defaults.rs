//! Collections synchronized out of the box.

use crate::sync::types::CollectionSpec;

/// Lock columns live on the settings row but must never travel with it.
pub const LOCK_COLUMNS: &[&str] = &["mv_hash", "mv_ts", "mv_locked"];

/// Built-in collections, before any configured ones.
#[must_use]
pub fn default_collections() -> Vec<(String, CollectionSpec)> {
    vec![(
        "settings".to_string(),
        CollectionSpec::new(["settings"]).exclude(LOCK_COLUMNS),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_excludes_lock_columns() {
        let defaults = default_collections();
        let (name, spec) = &defaults[0];
        assert_eq!(name, "settings");
        assert_eq!(spec.watch, vec!["settings"]);
        for column in LOCK_COLUMNS {
            assert!(spec.exclude_fields.iter().any(|f| f == column));
        }
    }
}
