//! SQLite storage layer.
//!
//! This module provides the live store the sync engine works against:
//! - A shared connection with transaction discipline for atomic writes
//! - Embedded migrations adding the lock row and its columns
//! - The record store and schema service implementations
//!
//! # Submodules
//!
//! - [`migrations`] - Embedded migrations
//! - [`sqlite`] - Connection handle
//! - [`store`] - Records by table
//! - [`schema_service`] - Snapshots, diffs and schema changes

pub mod migrations;
pub mod schema_service;
pub mod sqlite;
pub mod store;

pub use schema_service::SqliteSchemaService;
pub use sqlite::Database;
pub use store::SqliteStore;
