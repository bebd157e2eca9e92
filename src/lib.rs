//! Tenant-Forge Library
//!
//! Core of a multi-tenant database platform hosting many independent
//! modules on one PostgreSQL cluster. [`database::manager::DatabaseManager`]
//! is the entry point; it wires pooling, caching, migrations, isolation,
//! auditing, partitioning and backups behind one query façade.
//! The operator binary is in src/main.rs.

pub mod backup;
pub mod cache;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod isolation;
pub mod migration;
pub mod partition;
pub mod query;
pub mod security;
pub mod single_flight;

pub use database::manager::DatabaseManager;
pub use error::{Result, TenantForgeError};
