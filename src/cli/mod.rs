//! CLI module
//!
//! The operator console: a REPL and the `/` command handlers behind it.

pub mod commands;
pub mod repl;

// Re-exports
pub use repl::Repl;
