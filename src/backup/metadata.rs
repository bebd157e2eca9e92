//! Backup records

use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Complete logical dump of the module schema
    Full,
    /// Rows changed since the latest usable backup of any type
    Incremental,
    /// Rows changed since the latest usable full backup
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            other => Err(TenantForgeError::InvalidInput(format!("unknown backup type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
    Verified,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Verified => "verified",
        }
    }

    /// Completed or verified backups can serve as a base or be restored
    pub fn is_usable(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Verified)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backup artifact and its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: Uuid,
    pub module_name: String,
    pub schema_name: String,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub compressed: bool,
    pub row_count: i64,
    pub table_count: i64,
    pub base_backup_id: Option<Uuid>,
    /// Lower bound of the captured changes for incremental and differential
    /// backups
    pub changes_since: Option<DateTime<Utc>>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl BackupMetadata {
    /// A fresh `running` record
    pub fn running(module: &str, schema: &str, backup_type: BackupType, file_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_name: module.to_string(),
            schema_name: schema.to_string(),
            backup_type,
            status: BackupStatus::Running,
            file_path,
            size_bytes: 0,
            checksum: None,
            compressed: false,
            row_count: 0,
            table_count: 0,
            base_backup_id: None,
            changes_since: None,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Point in time the backup captures
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}

/// What to back up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    /// Only these tables; empty means all
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
        }
    }
}

impl BackupOptions {
    pub fn of_type(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            ..Default::default()
        }
    }

    /// Whether `table` passes the include/exclude filters
    pub fn selects(&self, table: &str) -> bool {
        (self.include_tables.is_empty() || self.include_tables.iter().any(|t| t == table))
            && !self.exclude_tables.iter().any(|t| t == table)
    }
}

/// A timestamp plus the backups needed to reach it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePoint {
    pub id: Uuid,
    pub module_name: String,
    pub label: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Full backup first, then each link in apply order
    pub backup_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// How to get a module back to a point in time
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    pub module_name: String,
    pub target_time: DateTime<Utc>,
    pub chain: Vec<BackupMetadata>,
    pub estimated_duration: Duration,
    pub total_bytes: u64,
    /// Set when the newest usable backup predates the target
    pub data_loss_warning: Option<String>,
}

/// Outcome of a restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub target_schema: String,
    pub backups_applied: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_and_status_strings() {
        assert_eq!("Incremental".parse::<BackupType>().unwrap(), BackupType::Incremental);
        assert!("weekly".parse::<BackupType>().is_err());
        assert!(BackupStatus::Verified.is_usable());
        assert!(!BackupStatus::Running.is_usable());
        assert!(!BackupStatus::Failed.is_usable());
    }

    #[test]
    fn test_table_filters() {
        let mut options = BackupOptions::default();
        assert!(options.selects("pedidos"));

        options.include_tables = vec!["pedidos".to_string(), "clientes".to_string()];
        options.exclude_tables = vec!["clientes".to_string()];
        assert!(options.selects("pedidos"));
        assert!(!options.selects("clientes"));
        assert!(!options.selects("produtos"));
    }
}
