//! Schema and data sync between a live store and JSON files.
//!
//! Each configured collection is written to `data/<collection>.json` as
//! canonical, key-sorted JSON so exports diff cleanly under version control.
//! The schema is written next to it as `schema.json` (plus one file per
//! collection in split mode).
//!
//! - **Export**: read the store, strip excluded fields, write the files
//! - **Import**: diff the files against the store, insert in dependency
//!   order, update what changed, then delete what is gone
//! - **Hashing**: `hash.txt` stamps the export so every instance applies it
//!   exactly once
//! - **Locking**: a single settings row arbitrates which instance applies a
//!   new export
//!
//! # Example
//!
//! ```ignore
//! use schema_sync::sync::{CollectionSpec, ExportManager};
//!
//! let mut manager = ExportManager::new(data_dir);
//! manager.add_collections(&store, [("posts".into(), CollectionSpec::new(["posts"]))]);
//! manager.export_all().await?;
//! manager.load_all(false).await?;
//! ```

pub mod canonical;
pub mod collection;
pub mod condense;
pub mod defaults;
pub mod events;
pub mod file;
pub mod hash;
pub mod hooks;
pub mod lock;
#[cfg(test)]
pub(crate) mod memory;
pub mod orchestrator;
pub mod partition;
pub mod schema;
pub mod service;
pub mod types;
pub mod vendor;

pub use collection::{CollectionSynchronizer, dependency_order};
pub use condense::ActionCondenser;
pub use defaults::default_collections;
pub use events::EventBus;
pub use hash::{ExportMeta, MetaStamp, content_hash};
pub use hooks::{StartupOutcome, SyncRuntime, build_manager};
pub use lock::{LockState, UpdateManager};
pub use orchestrator::{ExportManager, Synchronizer};
pub use schema::{SchemaOptions, SchemaSynchronizer};
pub use service::{CollectionInfo, FieldInfo, ItemStore, SchemaService, Snapshot, SnapshotDiff};
pub use types::{CollectionSpec, LoadStats, Query, Record, SyncError, SyncResult};
pub use vendor::ModifierRegistry;
