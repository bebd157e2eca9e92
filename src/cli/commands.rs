//! Command handlers for CLI
//!
//! This module implements all `/` commands of the operator console.

use crate::backup::BackupType;
use crate::database::indexer;
use crate::database::manager::DatabaseManager;
use crate::error::{Result, TenantForgeError};
use crate::isolation::IsolationConfig;
use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use uuid::Uuid;

/// Command types
#[derive(Debug, Clone, PartialEq)]
pub enum CommandType {
    /// List hosted modules
    Modules,
    /// Provision a module with default isolation settings
    Register { module: String },
    /// Apply pending migrations, optionally up to a version
    Migrate { module: String, target: Option<String> },
    /// Roll back one applied migration
    Rollback { module: String, version: String },
    /// Show migration status
    Status { module: String },
    /// Tables owned by a module
    Tables { module: String },
    /// Take a backup
    Backup { module: String, backup_type: BackupType },
    /// Restore a backup into a new schema
    Restore { module: String, backup_id: Uuid },
    /// Show the recovery plan for a point in time
    Plan { module: String, at: Option<DateTime<Utc>> },
    /// Run partition maintenance
    Maintenance,
    /// Delete rows past their retention window
    Cleanup,
    /// Run the suspicious activity heuristics
    Scan,
    /// Platform health
    Health,
    /// Pool and cache metrics
    Metrics,
    /// Drop a module's cache entries
    Invalidate { module: String },
    /// Show help message
    Help,
    /// Exit the application
    Quit,
}

/// Parsed command
#[derive(Debug, Clone)]
pub struct Command {
    /// The type of command
    pub command_type: CommandType,
}

fn usage(expected: &str) -> TenantForgeError {
    TenantForgeError::InvalidInput(format!("usage: {}", expected))
}

impl Command {
    /// Parse a command from user input
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if !input.starts_with('/') {
            return Err(TenantForgeError::InvalidInput(
                "commands start with '/', try /help".to_string(),
            ));
        }

        let parts: Vec<&str> = input.split_whitespace().collect();
        let arg = |i: usize, expected: &str| -> Result<String> {
            parts.get(i).map(|s| s.to_string()).ok_or_else(|| usage(expected))
        };
        let optional = |i: usize| parts.get(i).map(|s| s.to_string());

        let command_type = match parts[0] {
            "/modules" => CommandType::Modules,
            "/register" => CommandType::Register {
                module: arg(1, "/register <module>")?,
            },
            "/migrate" => CommandType::Migrate {
                module: arg(1, "/migrate <module> [version]")?,
                target: optional(2),
            },
            "/rollback" => CommandType::Rollback {
                module: arg(1, "/rollback <module> <version>")?,
                version: arg(2, "/rollback <module> <version>")?,
            },
            "/status" => CommandType::Status {
                module: arg(1, "/status <module>")?,
            },
            "/tables" => CommandType::Tables {
                module: arg(1, "/tables <module>")?,
            },
            "/backup" => CommandType::Backup {
                module: arg(1, "/backup <module> [full|incremental|differential]")?,
                backup_type: optional(2)
                    .map(|t| t.parse())
                    .transpose()?
                    .unwrap_or(BackupType::Full),
            },
            "/restore" => {
                let raw = arg(2, "/restore <module> <backup_id>")?;
                CommandType::Restore {
                    module: arg(1, "/restore <module> <backup_id>")?,
                    backup_id: raw
                        .parse()
                        .map_err(|_| TenantForgeError::InvalidInput(format!("not a backup id: {}", raw)))?,
                }
            }
            "/plan" => {
                let at = match optional(2) {
                    Some(raw) => Some(
                        DateTime::parse_from_rfc3339(&raw)
                            .map_err(|e| TenantForgeError::InvalidInput(format!("bad timestamp {}: {}", raw, e)))?
                            .with_timezone(&Utc),
                    ),
                    None => None,
                };
                CommandType::Plan {
                    module: arg(1, "/plan <module> [rfc3339 timestamp]")?,
                    at,
                }
            }
            "/maintenance" => CommandType::Maintenance,
            "/cleanup" => CommandType::Cleanup,
            "/scan" => CommandType::Scan,
            "/health" => CommandType::Health,
            "/metrics" => CommandType::Metrics,
            "/invalidate" => CommandType::Invalidate {
                module: arg(1, "/invalidate <module>")?,
            },
            "/help" => CommandType::Help,
            "/quit" | "/exit" => CommandType::Quit,
            other => {
                return Err(TenantForgeError::InvalidInput(format!(
                    "unknown command: {}",
                    other
                )))
            }
        };
        Ok(Command { command_type })
    }
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Handle a command and return the text to print
pub async fn handle_command(command: &Command, platform: &DatabaseManager) -> Result<String> {
    match &command.command_type {
        CommandType::Modules => {
            let modules = platform.registry().list().await;
            if modules.is_empty() {
                return Ok("No modules registered".to_string());
            }
            let mut out = table(vec!["Module", "Schema", "State", "Registered"]);
            for m in modules {
                out.add_row(vec![
                    m.module_name,
                    m.schema_name,
                    m.state.to_string(),
                    m.registered_at.to_rfc3339(),
                ]);
            }
            Ok(out.to_string())
        }
        CommandType::Register { module } => {
            let provisioned = platform.create_module(IsolationConfig::new(module.as_str())).await?;
            let applied = provisioned.migrations.map_or(0, |r| r.applied.len());
            Ok(format!(
                "✓ Module {} is {} in schema {} ({} migrations applied)",
                module, provisioned.registration.state, provisioned.registration.schema_name, applied
            ))
        }
        CommandType::Migrate { module, target } => {
            let report = platform.migrations()?.run(module, target.as_deref()).await?;
            let mut message = if report.applied.is_empty() {
                format!("✓ {} is up to date", module)
            } else {
                format!("✓ Applied {} to {}", report.applied.join(", "), module)
            };
            if !report.skipped_target.is_empty() {
                message.push_str(&format!(" (held back: {})", report.skipped_target.join(", ")));
            }
            Ok(message)
        }
        CommandType::Rollback { module, version } => {
            platform.migrations()?.rollback(module, version).await?;
            Ok(format!("✓ Rolled back {}/{}", module, version))
        }
        CommandType::Status { module } => {
            let records = platform.migrations()?.status(module).await?;
            let mut out = table(vec!["Version", "Name", "Status", "Applied", "ms", "Error"]);
            for r in records {
                out.add_row(vec![
                    r.migration.version,
                    r.migration.name,
                    r.status.to_string(),
                    or_dash(r.applied_at.map(|t| t.to_rfc3339())),
                    or_dash(r.execution_ms),
                    or_dash(r.error_message),
                ]);
            }
            Ok(out.to_string())
        }
        CommandType::Tables { module } => {
            let registration = platform.registry().require_active(module).await?;
            let pool = platform.pools().pool(module).await?;
            let tables = indexer::index_schema(pool.inner(), &registration.schema_name).await?;
            if tables.is_empty() {
                return Ok(format!("{} has no tables", registration.schema_name));
            }
            let mut out = table(vec!["Table", "Columns", "Primary key", "Rows (est.)", "Bytes", "Partitioned"]);
            for t in tables {
                out.add_row(vec![
                    t.name,
                    t.columns.len().to_string(),
                    t.primary_keys.join(", "),
                    or_dash(t.estimated_rows),
                    or_dash(t.size_bytes),
                    t.is_partitioned.to_string(),
                ]);
            }
            Ok(out.to_string())
        }
        CommandType::Backup { module, backup_type } => {
            let backup = platform
                .backups()?
                .execute_backup(module, crate::backup::BackupOptions::of_type(*backup_type))
                .await?;
            Ok(format!(
                "✓ {} backup {} of {}: {} bytes, {} rows, {}",
                backup.backup_type,
                backup.id,
                module,
                backup.size_bytes,
                backup.row_count,
                backup.status
            ))
        }
        CommandType::Restore { module, backup_id } => {
            let outcome = platform.backups()?.restore_from_backup(module, *backup_id, None).await?;
            Ok(format!(
                "✓ Restored {} backup(s) into schema {}",
                outcome.backups_applied.len(),
                outcome.target_schema
            ))
        }
        CommandType::Plan { module, at } => {
            let plan = platform
                .backups()?
                .get_recovery_plan(module, at.unwrap_or_else(Utc::now))
                .await?;
            let mut out = table(vec!["Backup", "Type", "Captured", "Bytes"]);
            for link in &plan.chain {
                out.add_row(vec![
                    link.id.to_string(),
                    link.backup_type.to_string(),
                    link.captured_at().to_rfc3339(),
                    link.size_bytes.to_string(),
                ]);
            }
            let mut message = format!(
                "{}\nEstimated restore time: {}s for {} bytes",
                out,
                plan.estimated_duration.as_secs(),
                plan.total_bytes
            );
            if let Some(warning) = plan.data_loss_warning {
                message.push_str(&format!("\n⚠ {}", warning));
            }
            Ok(message)
        }
        CommandType::Maintenance => {
            let reports = platform.partitions()?.run_maintenance().await;
            if reports.is_empty() {
                return Ok("No partitioned tables registered".to_string());
            }
            let mut out = table(vec!["Table", "Created", "Dropped", "Conflicts", "Analyzed", "Error"]);
            for r in reports {
                out.add_row(vec![
                    format!("{}.{}", r.schema, r.table),
                    r.created.len().to_string(),
                    r.dropped.len().to_string(),
                    r.conflicts.len().to_string(),
                    r.analyzed.to_string(),
                    or_dash(r.error),
                ]);
            }
            Ok(out.to_string())
        }
        CommandType::Cleanup => {
            let report = platform.isolation()?.cleanup_expired_data().await;
            let mut out = table(vec!["Module", "Table", "Deleted"]);
            for t in &report.tables {
                out.add_row(vec![t.module.clone(), t.table.clone(), t.deleted.to_string()]);
            }
            for f in &report.failures {
                out.add_row(vec![f.module.clone(), "-".to_string(), format!("failed: {}", f.error)]);
            }
            Ok(format!("{}\n✓ {} rows deleted", out, report.total_deleted()))
        }
        CommandType::Scan => {
            let alerts = platform.security()?.detect_suspicious_activity().await?;
            if alerts.is_empty() {
                return Ok("✓ No suspicious activity".to_string());
            }
            let mut out = table(vec!["Severity", "Heuristic", "User", "Table", "Events", "Description"]);
            for a in alerts {
                out.add_row(vec![
                    a.severity.to_string(),
                    a.heuristic.as_str().to_string(),
                    or_dash(a.user_id),
                    format!("{}.{}", a.schema_name, a.table_name),
                    a.event_count.to_string(),
                    a.description,
                ]);
            }
            Ok(out.to_string())
        }
        CommandType::Health => {
            let health = platform.health().await;
            Ok(format!(
                "{} platform, {} pool(s), cache {}",
                if health.healthy { "✓ healthy" } else { "✗ unhealthy" },
                health.pools.len(),
                if health.cache_connected { "connected" } else { "disconnected" }
            ))
        }
        CommandType::Metrics => {
            let mut out = table(vec!["Pool", "Size", "Active", "Idle", "Waiting", "Avg ms", "Queries", "Errors", "Healthy"]);
            for m in platform.pools().metrics().await {
                out.add_row(vec![
                    m.name,
                    m.size.to_string(),
                    m.active.to_string(),
                    m.idle.to_string(),
                    m.waiting.to_string(),
                    format!("{:.2}", m.avg_latency_ms),
                    m.total_queries.to_string(),
                    m.total_errors.to_string(),
                    m.healthy.to_string(),
                ]);
            }
            let mut message = out.to_string();
            if let Ok(cache) = platform.cache() {
                let stats = cache.stats();
                message.push_str(&format!(
                    "\nCache: {} local hits, {} remote hits, {} misses, {} local entries",
                    stats.local_hits, stats.remote_hits, stats.misses, stats.local_entries
                ));
            }
            Ok(message)
        }
        CommandType::Invalidate { module } => {
            let removed = platform.cache()?.invalidate_module(module, "operator request").await?;
            Ok(format!("✓ Removed {} cache entries of {}", removed, module))
        }
        CommandType::Help => Ok(HELP.to_string()),
        CommandType::Quit => Ok("Goodbye!".to_string()),
    }
}

const HELP: &str = r#"
Tenant-Forge Commands

Modules:
  /modules                         List hosted modules
  /register <module>               Provision a module (schema, isolation, migrations)
  /migrate <module> [version]      Apply pending migrations
  /rollback <module> <version>     Roll back an applied migration
  /status <module>                 Migration status
  /tables <module>                 Tables owned by a module

Backups:
  /backup <module> [type]          full (default), incremental or differential
  /restore <module> <backup_id>    Restore into a new schema
  /plan <module> [timestamp]       Recovery plan for an RFC 3339 point in time

Maintenance:
  /maintenance                     Create, drop and analyze partitions
  /cleanup                         Delete rows past their retention window
  /scan                            Look for suspicious access patterns
  /invalidate <module>             Drop a module's cache entries

Platform:
  /health                          Aggregate health
  /metrics                         Pool and cache metrics
  /help                            Show this help message
  /quit, /exit                     Exit
"#;

/// Format an error for display
pub fn format_error(error: &TenantForgeError) -> String {
    format!("Error [{}]: {}", error.kind(), error.sanitized_message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_command() {
        let cmd = Command::parse("/register vendas").unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Register {
                module: "vendas".to_string()
            }
        );
    }

    #[test]
    fn test_parse_migrate_command() {
        let cmd = Command::parse("/migrate vendas").unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Migrate {
                module: "vendas".to_string(),
                target: None
            }
        );

        let cmd = Command::parse("/migrate vendas 003").unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Migrate {
                module: "vendas".to_string(),
                target: Some("003".to_string())
            }
        );
    }

    #[test]
    fn test_parse_backup_command() {
        let cmd = Command::parse("/backup vendas").unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Backup {
                module: "vendas".to_string(),
                backup_type: BackupType::Full
            }
        );

        let cmd = Command::parse("/backup vendas incremental").unwrap();
        assert!(matches!(
            cmd.command_type,
            CommandType::Backup {
                backup_type: BackupType::Incremental,
                ..
            }
        ));
        assert!(Command::parse("/backup vendas weekly").is_err());
    }

    #[test]
    fn test_parse_restore_and_plan() {
        let id = Uuid::new_v4();
        let cmd = Command::parse(&format!("/restore vendas {}", id)).unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Restore {
                module: "vendas".to_string(),
                backup_id: id
            }
        );
        assert!(Command::parse("/restore vendas not-a-uuid").is_err());

        let cmd = Command::parse("/plan vendas 2024-05-01T12:00:00Z").unwrap();
        match cmd.command_type {
            CommandType::Plan { at: Some(at), .. } => assert_eq!(at.to_rfc3339(), "2024-05-01T12:00:00+00:00"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Command::parse("/plan vendas yesterday").is_err());
    }

    #[test]
    fn test_parse_quit_command() {
        let cmd1 = Command::parse("/quit").unwrap();
        assert_eq!(cmd1.command_type, CommandType::Quit);

        let cmd2 = Command::parse("/exit").unwrap();
        assert_eq!(cmd2.command_type, CommandType::Quit);
    }

    #[test]
    fn test_parse_invalid_command() {
        assert!(Command::parse("/invalid").is_err());
        assert!(Command::parse("select 1").is_err());
    }

    #[test]
    fn test_parse_missing_args() {
        assert!(Command::parse("/register").is_err());
        assert!(Command::parse("/rollback vendas").is_err());
        assert!(Command::parse("/invalidate").is_err());
        assert!(Command::parse("/tables").is_err());
    }
}
