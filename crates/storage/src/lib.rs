//! Database registry for replimesh
//!
//! This crate provides the storage side of replimesh, including:
//! - The replication engine and database seams
//! - Write access policy resolution
//! - The registry of open databases and their info snapshots
//! - An in-memory engine for tests

use thiserror::Error;

pub mod access;
pub mod database;
pub mod mock;
pub mod registry;

// Re-export commonly used types
pub use access::{AccessController, WritePolicy};
pub use database::{
    Capabilities, Capability, Database, DatabaseAddress, DatabaseOptions, Identity, OpenParams,
    ReplicationEngine,
};
pub use registry::{DatabaseInfo, DatabaseRegistry};

/// Storage-related errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Opening db {name} failed: {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Loading db {name} failed: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("Closing db {name} failed: {reason}")]
    CloseFailed { name: String, reason: String },

    /// The task opening the database went away before settling
    #[error("Open of db {0} was abandoned")]
    OpenAbandoned(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
