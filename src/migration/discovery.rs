//! Migration files
//!
//! A migration file is named `V<version>__<name>.sql` or
//! `<version>_<name>.sql`. Header comments may override or extend what the
//! filename says:
//!
//! ```sql
//! -- version: 002
//! -- depends: 001
//! -- description: add invoices
//! -- +up
//! CREATE TABLE invoices (...);
//! -- +down
//! DROP TABLE invoices;
//! ```

use crate::error::{Result, TenantForgeError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Lifecycle of a registered migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "applied" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            "rolled_back" => Ok(MigrationStatus::RolledBack),
            other => Err(TenantForgeError::InvalidInput(format!(
                "unknown migration status: {}",
                other
            ))),
        }
    }
}

/// A parsed migration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub module_name: String,
    pub version: String,
    pub name: String,
    pub filename: String,
    pub checksum: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    pub dependencies: Vec<String>,
    pub description: Option<String>,
}

/// SHA-256 of the file content, hex encoded
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Compare versions with numeric runs compared as numbers (`2 < 10`)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (left, right) = (segments(a), segments(b));
    for (x, y) in left.iter().zip(right.iter()) {
        let ordering = match (x, y) {
            (Segment::Number(x), Segment::Number(y)) => {
                let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Segment::Number(_), Segment::Text(_)) => Ordering::Less,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Greater,
            (Segment::Text(x), Segment::Text(y)) => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

enum Segment<'a> {
    Number(&'a str),
    Text(&'a str),
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = version.as_bytes();
    for i in 1..=bytes.len() {
        let boundary = i == bytes.len() || bytes[i].is_ascii_digit() != bytes[start].is_ascii_digit();
        if boundary {
            let run = &version[start..i];
            if bytes[start].is_ascii_digit() {
                out.push(Segment::Number(run));
            } else {
                out.push(Segment::Text(run));
            }
            start = i;
        }
    }
    out
}

/// Version and name encoded in a migration filename
pub fn parse_filename(filename: &str) -> Option<(String, String)> {
    let stem = filename.strip_suffix(".sql")?;

    let (version, name) = match stem.strip_prefix('V').or_else(|| stem.strip_prefix('v')) {
        Some(rest) if rest.contains("__") => rest.split_once("__")?,
        _ => stem.split_once('_')?,
    };

    let valid = version.starts_with(|c: char| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
    if !valid || name.is_empty() {
        return None;
    }
    Some((version.to_string(), name.to_string()))
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Up,
    Down,
}

fn section_marker(line: &str) -> Option<Section> {
    match line.trim().to_ascii_lowercase().as_str() {
        "-- +up" | "-- migrate:up" => Some(Section::Up),
        "-- +down" | "-- migrate:down" => Some(Section::Down),
        _ => None,
    }
}

fn metadata<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix("--")?.trim_start();
    let (found, value) = rest.split_once(':')?;
    found.trim().eq_ignore_ascii_case(key).then(|| value.trim())
}

/// Parse one migration file
pub fn parse_migration(module: &str, filename: &str, content: &str) -> Result<Migration> {
    let from_name = parse_filename(filename);

    let mut version = from_name.as_ref().map(|(v, _)| v.clone());
    let mut dependencies = Vec::new();
    let mut description = None;
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut section = Section::Up;

    for line in content.lines() {
        if let Some(marker) = section_marker(line) {
            section = marker;
            continue;
        }
        if let Some(v) = metadata(line, "version") {
            version = Some(v.to_string());
            continue;
        }
        if let Some(deps) = metadata(line, "depends") {
            dependencies.extend(
                deps.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            );
            continue;
        }
        if let Some(text) = metadata(line, "description") {
            description = Some(text.to_string());
            continue;
        }
        match section {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
        }
    }

    let version = version.ok_or_else(|| {
        TenantForgeError::InvalidInput(format!("migration {} has no version", filename))
    })?;
    let up_sql = up.join("\n").trim().to_string();
    if up_sql.is_empty() {
        return Err(TenantForgeError::migration(module, &version, "migration has no up statements"));
    }
    let down_sql = Some(down.join("\n").trim().to_string()).filter(|s| !s.is_empty());

    dependencies.retain(|d| d != &version);
    dependencies.dedup();

    Ok(Migration {
        module_name: module.to_string(),
        name: from_name
            .map(|(_, name)| name)
            .unwrap_or_else(|| filename.trim_end_matches(".sql").to_string()),
        version,
        filename: filename.to_string(),
        checksum: checksum(content),
        up_sql,
        down_sql,
        dependencies,
        description,
    })
}

/// Read every `.sql` file of a directory, sorted by version
pub async fn discover(module: &str, dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    if !tokio::fs::try_exists(dir).await? {
        debug!(module, path = %dir.display(), "no migrations directory");
        return Ok(migrations);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let content = tokio::fs::read_to_string(&path).await?;
        migrations.push(parse_migration(module, filename, &content)?);
    }

    migrations.sort_by(|a, b| compare_versions(&a.version, &b.version));
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(TenantForgeError::migration(
                module,
                &pair[0].version,
                format!("version declared by both {} and {}", pair[0].filename, pair[1].filename),
            ));
        }
    }
    debug!(module, count = migrations.len(), "migrations discovered");
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("V001__create_clientes.sql"),
            Some(("001".to_string(), "create_clientes".to_string()))
        );
        assert_eq!(
            parse_filename("002_add_email.sql"),
            Some(("002".to_string(), "add_email".to_string()))
        );
        assert_eq!(
            parse_filename("V1.2__split.sql"),
            Some(("1.2".to_string(), "split".to_string()))
        );
        assert_eq!(parse_filename("readme.sql"), None);
        assert_eq!(parse_filename("001_x.txt"), None);
    }

    #[test]
    fn test_natural_version_order() {
        assert_eq!(compare_versions("2", "10"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("010", "009"), Ordering::Greater);
        assert_eq!(compare_versions("3", "3"), Ordering::Equal);
    }

    #[test]
    fn test_parse_sections_and_metadata() {
        let content = "-- description: clientes table\n-- depends: 000\n-- +up\nCREATE TABLE clientes (nome TEXT);\n-- +down\nDROP TABLE clientes;\n";
        let migration = parse_migration("vendas", "001_clientes.sql", content).unwrap();

        assert_eq!(migration.version, "001");
        assert_eq!(migration.name, "clientes");
        assert_eq!(migration.up_sql, "CREATE TABLE clientes (nome TEXT);");
        assert_eq!(migration.down_sql.as_deref(), Some("DROP TABLE clientes;"));
        assert_eq!(migration.dependencies, vec!["000"]);
        assert_eq!(migration.description.as_deref(), Some("clientes table"));
        assert_eq!(migration.checksum, checksum(content));
        assert_eq!(migration.checksum.len(), 64);
    }

    #[test]
    fn test_unmarked_file_is_all_up() {
        let migration = parse_migration("vendas", "V003__idx.sql", "CREATE INDEX i ON t (a);").unwrap();
        assert_eq!(migration.up_sql, "CREATE INDEX i ON t (a);");
        assert!(migration.down_sql.is_none());
    }

    #[test]
    fn test_metadata_version_overrides_filename() {
        let content = "-- version: 7\n-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 2;";
        let migration = parse_migration("vendas", "setup.sql", content).unwrap();
        assert_eq!(migration.version, "7");
        assert_eq!(migration.down_sql.as_deref(), Some("SELECT 2;"));
    }

    #[test]
    fn test_missing_version_rejected() {
        assert!(parse_migration("vendas", "setup.sql", "SELECT 1;").is_err());
    }

    #[tokio::test]
    async fn test_discover_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("010_late.sql"), "SELECT 10;").unwrap();
        std::fs::write(dir.path().join("V2__early.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let migrations = discover("vendas", dir.path()).await.unwrap();
        let versions: Vec<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["2", "010"]);
    }

    #[tokio::test]
    async fn test_discover_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = discover("vendas", &dir.path().join("absent")).await.unwrap();
        assert!(migrations.is_empty());
    }
}
