//! schema-sync - keep a live SQLite store and versioned JSON files in step.
//!
//! This crate provides the core functionality for the `schema-sync` CLI tool.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Sync root, environment switches and collection config files
//! - [`storage`] - SQLite implementations of the record and schema services
//! - [`sync`] - Export/import engine, content hashing and the shared lock row
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
