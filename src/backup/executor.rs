//! External backup utilities
//!
//! [`PgDumpExecutor`] drives `pg_dump` for full backups and `psql` for
//! change exports and restores. Every child process is killed when the
//! operation's [`CancelSignal`] fires.

use super::metadata::BackupType;
use crate::database::schema::{qualified, quote_ident, quote_literal};
use crate::error::{Result, TenantForgeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

/// Cancellation flag shared between a running operation and its owner
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let fired = receiver.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if fired.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs of one dump
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub database_url: String,
    pub schema: String,
    pub backup_type: BackupType,
    /// Change exports read rows with `updated_at` after this instant
    pub since: Option<DateTime<Utc>>,
    /// Tables to include; empty means the whole schema
    pub tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub output: PathBuf,
}

/// Counts gathered from a dump artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub row_count: i64,
    pub table_count: i64,
}

/// Inputs of one restore step
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub database_url: String,
    /// Schema the artifact was taken from
    pub source_schema: String,
    pub target_schema: String,
    pub backup_type: BackupType,
    /// Uncompressed artifact
    pub input: PathBuf,
}

/// Something that can write and replay backup artifacts
#[async_trait]
pub trait BackupExecutor: Send + Sync {
    async fn dump(&self, request: &DumpRequest, cancel: &CancelSignal) -> Result<DumpStats>;
    async fn restore(&self, request: &RestoreRequest, cancel: &CancelSignal) -> Result<()>;
}

/// `pg_dump` / `psql` based executor
#[derive(Debug, Clone)]
pub struct PgDumpExecutor {
    dump_command: String,
    sql_command: String,
}

impl PgDumpExecutor {
    pub fn new(dump_command: impl Into<String>, sql_command: impl Into<String>) -> Self {
        Self {
            dump_command: dump_command.into(),
            sql_command: sql_command.into(),
        }
    }

    async fn run(&self, mut command: Command, tool: &str, cancel: &CancelSignal) -> Result<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| TenantForgeError::BackupUtility {
            tool: tool.to_string(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                return Err(TenantForgeError::BackupAborted(format!("{} terminated on request", tool)));
            }
        };

        if output.status.success() {
            return Ok(());
        }
        Err(TenantForgeError::BackupUtility {
            tool: tool.to_string(),
            status: output
                .status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |code| format!("exit code {}", code)),
            stderr: crate::error::sanitize(String::from_utf8_lossy(&output.stderr).trim()),
        })
    }

    fn sql_client(&self, database_url: &str) -> Command {
        let mut command = Command::new(&self.sql_command);
        command
            .arg("--dbname")
            .arg(database_url)
            .arg("--no-psqlrc")
            .arg("--quiet")
            .arg("--set")
            .arg("ON_ERROR_STOP=1");
        command
    }
}

impl Default for PgDumpExecutor {
    fn default() -> Self {
        Self::new("pg_dump", "psql")
    }
}

#[async_trait]
impl BackupExecutor for PgDumpExecutor {
    async fn dump(&self, request: &DumpRequest, cancel: &CancelSignal) -> Result<DumpStats> {
        match request.backup_type {
            BackupType::Full => {
                let mut command = Command::new(&self.dump_command);
                command
                    .arg("--dbname")
                    .arg(&request.database_url)
                    .arg("--schema")
                    .arg(quote_ident(&request.schema)?)
                    .arg("--no-owner")
                    .arg("--no-privileges")
                    .arg("--file")
                    .arg(&request.output);
                for table in &request.tables {
                    command.arg("--table").arg(qualified(&request.schema, table)?);
                }
                for table in &request.exclude_tables {
                    command.arg("--exclude-table").arg(qualified(&request.schema, table)?);
                }
                debug!(schema = %request.schema, output = %request.output.display(), "running full dump");
                self.run(command, &self.dump_command, cancel).await?;

                let content = tokio::fs::read_to_string(&request.output).await?;
                Ok(dump_stats(&content))
            }
            BackupType::Incremental | BackupType::Differential => {
                let since = request.since.ok_or_else(|| {
                    TenantForgeError::InvalidInput("change export needs a starting point".to_string())
                })?;
                if request.tables.is_empty() {
                    tokio::fs::write(&request.output, b"").await?;
                    return Ok(DumpStats::default());
                }

                let query = change_export_sql(&request.schema, &request.tables, since)?;
                let mut command = self.sql_client(&request.database_url);
                command
                    .arg("--no-align")
                    .arg("--tuples-only")
                    .arg("--command")
                    .arg(query)
                    .arg("--output")
                    .arg(&request.output);
                debug!(schema = %request.schema, since = %since, "exporting changed rows");
                self.run(command, &self.sql_command, cancel).await?;

                let content = tokio::fs::read_to_string(&request.output).await?;
                Ok(change_stats(&content))
            }
        }
    }

    async fn restore(&self, request: &RestoreRequest, cancel: &CancelSignal) -> Result<()> {
        let content = tokio::fs::read_to_string(&request.input).await?;
        let script = match request.backup_type {
            BackupType::Full => rewrite_schema(&content, &request.source_schema, &request.target_schema)?,
            BackupType::Incremental | BackupType::Differential => {
                change_apply_sql(&content, &request.target_schema)?
            }
        };

        let script_path = request.input.with_extension("restore.sql");
        tokio::fs::write(&script_path, script).await?;

        let mut command = self.sql_client(&request.database_url);
        command.arg("--single-transaction").arg("--file").arg(&script_path);
        let outcome = self.run(command, &self.sql_command, cancel).await;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            debug!(path = %script_path.display(), error = %e, "restore script not removed");
        }
        outcome
    }
}

/// Table and row counts of a plain-format `pg_dump` file
pub fn dump_stats(content: &str) -> DumpStats {
    let mut stats = DumpStats::default();
    let mut in_copy = false;
    for line in content.lines() {
        if in_copy {
            if line == "\\." {
                in_copy = false;
            } else {
                stats.row_count += 1;
            }
        } else if line.starts_with("CREATE TABLE ") {
            stats.table_count += 1;
        } else if line.starts_with("COPY ") && line.ends_with("FROM stdin;") {
            in_copy = true;
        }
    }
    stats
}

/// Table and row counts of a change export (`table<TAB>json` lines)
pub fn change_stats(content: &str) -> DumpStats {
    let mut tables = HashSet::new();
    let mut rows = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        if let Some((table, _)) = line.split_once('\t') {
            tables.insert(table);
            rows += 1;
        }
    }
    DumpStats {
        row_count: rows,
        table_count: tables.len() as i64,
    }
}

/// Query exporting rows changed after `since` as `table<TAB>json` lines
pub fn change_export_sql(schema: &str, tables: &[String], since: DateTime<Utc>) -> Result<String> {
    let since = quote_literal(&since.to_rfc3339());
    let selects = tables
        .iter()
        .map(|table| {
            Ok(format!(
                "SELECT {} || chr(9) || row_to_json(t)::text FROM {} t WHERE t.\"updated_at\" > {}::timestamptz",
                quote_literal(table),
                qualified(schema, table)?,
                since
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(selects.join(" UNION ALL "))
}

/// Point a plain dump at another schema
pub fn rewrite_schema(dump: &str, source: &str, target: &str) -> Result<String> {
    let target_q = quote_ident(target)?;
    let pattern = Regex::new(&format!(
        r#"(?m)(^CREATE SCHEMA )(?:{0}|"{0}")(;)|(?:\b{0}|"{0}")\."#,
        regex::escape(source)
    ))
    .map_err(|e| TenantForgeError::InvalidInput(format!("cannot rewrite schema {}: {}", source, e)))?;

    Ok(pattern
        .replace_all(dump, |caps: &regex::Captures<'_>| match (caps.get(1), caps.get(2)) {
            (Some(create), Some(end)) => format!("{}{}{}", create.as_str(), target_q, end.as_str()),
            _ => format!("{}.", target_q),
        })
        .into_owned())
}

/// Script replaying a change export into `target`.
///
/// Rows with an `id` replace the existing row with that id; others are
/// inserted.
pub fn change_apply_sql(export: &str, target: &str) -> Result<String> {
    let mut script = String::new();
    for line in export.lines().filter(|l| !l.trim().is_empty()) {
        let Some((table, json)) = line.split_once('\t') else {
            return Err(TenantForgeError::InvalidInput(format!(
                "malformed change export line: {}",
                line.chars().take(80).collect::<String>()
            )));
        };
        let row: serde_json::Value = serde_json::from_str(json)?;
        let target_table = qualified(target, table)?;
        let literal = quote_literal(json);

        if let Some(id) = row.get("id").and_then(|v| v.as_str()) {
            script.push_str(&format!(
                "DELETE FROM {} WHERE \"id\"::text = {};\n",
                target_table,
                quote_literal(id)
            ));
        }
        script.push_str(&format!(
            "INSERT INTO {0} SELECT * FROM json_populate_record(NULL::{0}, {1}::json);\n",
            target_table, literal
        ));
    }
    Ok(script)
}

/// Whether `path` points at a gzip artifact
pub fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dump_stats() {
        let dump = "CREATE TABLE module_vendas.pedidos (\n id uuid\n);\nCOPY module_vendas.pedidos (id) FROM stdin;\na\nb\n\\.\nCREATE TABLE module_vendas.clientes (\n id uuid\n);\n";
        assert_eq!(dump_stats(dump), DumpStats { row_count: 2, table_count: 2 });
    }

    #[test]
    fn test_change_stats() {
        let export = "pedidos\t{\"id\":\"1\"}\npedidos\t{\"id\":\"2\"}\nclientes\t{\"id\":\"3\"}\n\n";
        assert_eq!(change_stats(export), DumpStats { row_count: 3, table_count: 2 });
    }

    #[test]
    fn test_change_export_sql() {
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let sql = change_export_sql("module_vendas", &["pedidos".to_string(), "clientes".to_string()], since).unwrap();
        assert!(sql.contains("SELECT 'pedidos' || chr(9) || row_to_json(t)::text FROM \"module_vendas\".\"pedidos\" t"));
        assert!(sql.contains("'2024-05-01T00:00:00+00:00'::timestamptz"));
        assert_eq!(sql.matches(" UNION ALL ").count(), 1);
    }

    #[test]
    fn test_rewrite_schema() {
        let dump = "CREATE SCHEMA module_vendas;\nCREATE TABLE module_vendas.pedidos (id uuid);\nALTER TABLE ONLY \"module_vendas\".pedidos ADD CONSTRAINT x;\nSELECT 'my_module_vendas.x';\n";
        let rewritten = rewrite_schema(dump, "module_vendas", "module_vendas_restore_1").unwrap();

        assert!(rewritten.contains("CREATE SCHEMA \"module_vendas_restore_1\";"));
        assert!(rewritten.contains("CREATE TABLE \"module_vendas_restore_1\".pedidos"));
        assert!(rewritten.contains("ALTER TABLE ONLY \"module_vendas_restore_1\".pedidos"));
        assert!(rewritten.contains("'my_module_vendas.x'"));
    }

    #[test]
    fn test_change_apply_sql() {
        let export = "pedidos\t{\"id\":\"abc\",\"nota\":\"it's\"}\n";
        let script = change_apply_sql(export, "restore_1").unwrap();

        assert!(script.contains("DELETE FROM \"restore_1\".\"pedidos\" WHERE \"id\"::text = 'abc';"));
        assert!(script.contains("json_populate_record(NULL::\"restore_1\".\"pedidos\", '{\"id\":\"abc\",\"nota\":\"it''s\"}'::json)"));
        assert!(change_apply_sql("garbage", "restore_1").is_err());
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        signal.cancel();
        handle.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_utility_reported() {
        let executor = PgDumpExecutor::new("tenant-forge-no-such-dump", "tenant-forge-no-such-psql");
        let dir = tempfile::tempdir().unwrap();
        let request = DumpRequest {
            database_url: "postgres://localhost/none".to_string(),
            schema: "module_vendas".to_string(),
            backup_type: BackupType::Full,
            since: None,
            tables: Vec::new(),
            exclude_tables: Vec::new(),
            output: dir.path().join("out.sql"),
        };
        let err = executor.dump(&request, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, TenantForgeError::BackupUtility { .. }));
    }
}
