//! Database module
//!
//! Per-module connection pools, identifier handling, parameter values,
//! catalog lookups and the module registry, plus the [`manager::DatabaseManager`]
//! that ties the platform together.

pub mod connection;
pub mod indexer;
pub mod manager;
pub mod registry;
pub mod schema;
pub mod value;

// Re-exports
pub use connection::{ModulePool, PoolManager, PoolMetrics};
pub use registry::{ModuleRegistration, ModuleRegistry, ModuleState};
pub use schema::{Column, ColumnType, ForeignKeyReference, Table};
pub use value::SqlValue;
