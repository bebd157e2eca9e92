//! Partition Manager
//!
//! Creates the initial partitions of a table for its strategy, converts
//! plain tables to partitioned ones online, and keeps date-ranged tables
//! healthy: look-ahead creation, retention drops and ANALYZE.

pub mod plan;

pub use plan::{PartitionBounds, PartitionMethod, PartitionSpec, PartitionStrategy};

use crate::database::connection::{ModulePool, PoolManager};
use crate::database::schema::{derived_identifier, qualified, quote_ident, validate_identifier};
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Partitions not analyzed for this many days need maintenance
const ANALYZE_STALE_DAYS: i64 = 7;

/// Partitioning of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub schema: String,
    pub table: String,
    /// Partition key column
    pub column: String,
    pub strategy: PartitionStrategy,
    /// Monthly partitions older than this are dropped (range_date only)
    pub retention_months: Option<u32>,
    pub auto_create: bool,
    pub auto_drop: bool,
    pub auto_analyze: bool,
    /// Months created ahead of the current one
    pub look_ahead: u32,
}

impl PartitionConfig {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        strategy: PartitionStrategy,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
            strategy,
            retention_months: None,
            auto_create: true,
            auto_drop: false,
            auto_analyze: true,
            look_ahead: 3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.table)?;
        validate_identifier(&self.column)?;
        let window = self.retention_months.unwrap_or(0).max(self.look_ahead);
        if window > plan::MAX_PLANNING_MONTHS {
            return Err(TenantForgeError::InvalidInput(format!(
                "look_ahead and retention_months must not exceed {} months",
                plan::MAX_PLANNING_MONTHS
            )));
        }
        self.strategy.validate()
    }
}

/// Result of creating a batch of partitions
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionReport {
    pub created: Vec<String>,
    /// Partitions skipped because they already exist or overlap
    pub conflicts: Vec<String>,
}

/// Result of [`PartitionManager::convert_to_partitioned`]
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub rows_copied: u64,
    pub partitions: PartitionReport,
    /// Where the original table was moved to
    pub archived_as: String,
}

/// Maintenance outcome for one table
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub schema: String,
    pub table: String,
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    pub conflicts: Vec<String>,
    pub analyzed: bool,
    pub error: Option<String>,
}

/// Statistics of one partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStat {
    pub name: String,
    pub size_bytes: i64,
    pub rows: i64,
    pub last_analyzed: Option<DateTime<Utc>>,
}

/// Aggregated partition statistics of a table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMetrics {
    pub schema: String,
    pub table: String,
    pub partition_count: usize,
    pub total_size_bytes: i64,
    pub total_rows: i64,
    pub oldest_partition: Option<String>,
    pub newest_partition: Option<String>,
    pub largest_partition: Option<String>,
    /// Partitions never analyzed or not analyzed within a week
    pub needs_maintenance: Vec<String>,
}

/// Fold partition statistics into [`TableMetrics`]
pub fn summarize(schema: &str, table: &str, mut partitions: Vec<PartitionStat>, now: DateTime<Utc>) -> TableMetrics {
    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    let stale_before = now - ChronoDuration::days(ANALYZE_STALE_DAYS);

    let dated: Vec<&PartitionStat> = partitions
        .iter()
        .filter(|p| plan::parse_monthly_name(table, &p.name).is_some())
        .collect();
    let ordered: Vec<&PartitionStat> = if dated.is_empty() {
        partitions.iter().collect()
    } else {
        dated
    };

    TableMetrics {
        schema: schema.to_string(),
        table: table.to_string(),
        partition_count: partitions.len(),
        total_size_bytes: partitions.iter().map(|p| p.size_bytes).sum(),
        total_rows: partitions.iter().map(|p| p.rows.max(0)).sum(),
        oldest_partition: ordered.first().map(|p| p.name.clone()),
        newest_partition: ordered.last().map(|p| p.name.clone()),
        largest_partition: partitions
            .iter()
            .max_by_key(|p| p.size_bytes)
            .map(|p| p.name.clone()),
        needs_maintenance: partitions
            .iter()
            .filter(|p| p.last_analyzed.map_or(true, |at| at < stale_before))
            .map(|p| p.name.clone())
            .collect(),
    }
}

/// Whether a failed `CREATE TABLE ... PARTITION OF` hit an existing or
/// overlapping partition
fn is_partition_conflict(error: &sqlx::Error) -> bool {
    let Some(db) = error.as_database_error() else {
        return false;
    };
    matches!(db.code().as_deref(), Some("42P07") | Some("42P17"))
        || db.message().contains("would overlap")
}

pub(crate) const PLATFORM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS platform.partition_configs (
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    config JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (schema_name, table_name)
);
"#;

pub struct PartitionManager {
    pools: Arc<PoolManager>,
    /// Role used to read every tenant's rows while converting
    service_role: Option<String>,
    configs: RwLock<HashMap<(String, String), PartitionConfig>>,
}

impl PartitionManager {
    pub fn new(pools: Arc<PoolManager>, service_role: Option<String>) -> Self {
        Self {
            pools,
            service_role,
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a config and persist it
    pub async fn register(&self, config: PartitionConfig) -> Result<()> {
        config.validate()?;
        let pool = self.pools.default_pool().await?;
        pool.execute(
            "INSERT INTO platform.partition_configs (schema_name, table_name, config)
             VALUES ($1, $2, $3)
             ON CONFLICT (schema_name, table_name) DO UPDATE
             SET config = EXCLUDED.config, updated_at = now()",
            &[
                SqlValue::from(config.schema.as_str()),
                SqlValue::from(config.table.as_str()),
                SqlValue::Json(serde_json::to_value(&config)?),
            ],
        )
        .await?;
        self.remember(config).await;
        Ok(())
    }

    /// Reload persisted configs
    pub async fn load_configs(&self) -> Result<usize> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query("SELECT config FROM platform.partition_configs", &[])
            .await?;

        let mut loaded = 0;
        for row in rows {
            let config: sqlx::types::Json<PartitionConfig> = row.try_get("config")?;
            self.remember(config.0).await;
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn remember(&self, config: PartitionConfig) {
        self.configs
            .write()
            .await
            .insert((config.schema.clone(), config.table.clone()), config);
    }

    pub async fn configs(&self) -> Vec<PartitionConfig> {
        let mut configs: Vec<_> = self.configs.read().await.values().cloned().collect();
        configs.sort_by(|a, b| (&a.schema, &a.table).cmp(&(&b.schema, &b.table)));
        configs
    }

    /// Drop the in-memory configs of a schema
    pub async fn forget_schema(&self, schema: &str) {
        self.configs.write().await.retain(|(s, _), _| s != schema);
    }

    /// Create the strategy's initial partitions on an existing partitioned table
    #[instrument(skip_all, fields(schema = %config.schema, table = %config.table, strategy = config.strategy.name()))]
    pub async fn create_initial_partitions(&self, config: &PartitionConfig) -> Result<PartitionReport> {
        config.validate()?;
        let pool = self.pools.default_pool().await?;
        let specs = plan::initial_partitions(&config.table, &config.strategy, Utc::now())?;
        create_partitions(&pool, &config.schema, &config.table, &specs).await
    }

    /// Replace a plain table with a partitioned one holding the same rows.
    ///
    /// The partitioned copy is built next to the live table, filled, then
    /// swapped in with one rename transaction; the original stays as
    /// `<table>_old`.
    #[instrument(skip_all, fields(schema = %config.schema, table = %config.table))]
    pub async fn convert_to_partitioned(&self, config: &PartitionConfig) -> Result<ConversionReport> {
        config.validate()?;
        let pool = self.pools.default_pool().await?;

        let shadow = derived_identifier(&config.table, "_partitioned");
        let archived = derived_identifier(&config.table, "_old");
        let live_q = qualified(&config.schema, &config.table)?;
        let shadow_q = qualified(&config.schema, &shadow)?;

        pool.execute_script(&format!(
            "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS) PARTITION BY {} ({})",
            shadow_q,
            live_q,
            config.strategy.method().as_sql(),
            quote_ident(&config.column)?
        ))
        .await?;

        let built = self.fill_shadow(&pool, config, &shadow, &live_q, &shadow_q).await;
        let (partitions, rows_copied) = match built {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "conversion failed, dropping partitioned copy");
                if let Err(drop_err) = pool
                    .execute_script(&format!("DROP TABLE IF EXISTS {} CASCADE", shadow_q))
                    .await
                {
                    warn!(error = %drop_err, "could not drop partitioned copy");
                }
                return Err(e);
            }
        };

        let swap = vec![
            format!("ALTER TABLE {} RENAME TO {}", live_q, quote_ident(&archived)?),
            format!("ALTER TABLE {} RENAME TO {}", shadow_q, quote_ident(&config.table)?),
        ];
        crate::isolation::run_statements(&pool, swap).await?;

        info!(rows = rows_copied, archived = %archived, "table converted to partitioned");
        Ok(ConversionReport {
            rows_copied,
            partitions,
            archived_as: archived,
        })
    }

    async fn fill_shadow(
        &self,
        pool: &ModulePool,
        config: &PartitionConfig,
        shadow: &str,
        live_q: &str,
        shadow_q: &str,
    ) -> Result<(PartitionReport, u64)> {
        let mut specs = plan::initial_partitions(&config.table, &config.strategy, Utc::now())?;
        if config.strategy.method().supports_default() {
            specs.push(plan::default_partition(&config.table));
        }
        let partitions = create_partitions(pool, &config.schema, shadow, &specs).await?;

        let copy = format!("INSERT INTO {} SELECT * FROM {}", shadow_q, live_q);
        let set_role = match &self.service_role {
            Some(role) => Some(format!("SET LOCAL ROLE {}", quote_ident(role)?)),
            None => None,
        };
        let name = pool.name().to_string();
        let rows = pool
            .transaction(move |conn| {
                Box::pin(async move {
                    if let Some(set_role) = set_role {
                        sqlx::query(&set_role)
                            .execute(&mut *conn)
                            .await
                            .map_err(|e| TenantForgeError::query(&name, 0, e))?;
                    }
                    let done = sqlx::query(&copy)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| TenantForgeError::query(&name, 0, e))?;
                    Ok(done.rows_affected())
                })
            })
            .await?;
        Ok((partitions, rows))
    }

    /// Maintain every registered table. A failing table is reported and the
    /// rest are still processed.
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) -> Vec<MaintenanceReport> {
        let mut reports = Vec::new();
        for config in self.configs().await {
            let mut report = MaintenanceReport {
                schema: config.schema.clone(),
                table: config.table.clone(),
                ..Default::default()
            };
            if let Err(e) = self.maintain(&config, &mut report).await {
                warn!(schema = %config.schema, table = %config.table, error = %e, "partition maintenance failed");
                report.error = Some(e.sanitized_message());
            }
            reports.push(report);
        }
        reports
    }

    async fn maintain(&self, config: &PartitionConfig, report: &mut MaintenanceReport) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        let now = Utc::now();

        if config.strategy == PartitionStrategy::RangeDate {
            let existing = self.list_partitions(&config.schema, &config.table).await?;

            if config.auto_create {
                let specs = plan::look_ahead_partitions(&config.table, &existing, config.look_ahead, now);
                let created = create_partitions(&pool, &config.schema, &config.table, &specs).await?;
                report.created = created.created;
                report.conflicts = created.conflicts;
            }

            if config.auto_drop {
                if let Some(months) = config.retention_months {
                    for name in plan::expired_partitions(&config.table, &existing, months, now) {
                        pool.execute_script(&format!(
                            "DROP TABLE IF EXISTS {}",
                            qualified(&config.schema, &name)?
                        ))
                        .await?;
                        info!(partition = %name, "expired partition dropped");
                        report.dropped.push(name);
                    }
                }
            }
        }

        if config.auto_analyze {
            pool.execute_script(&format!("ANALYZE {}", qualified(&config.schema, &config.table)?))
                .await?;
            report.analyzed = true;
        }
        Ok(())
    }

    /// Child partitions of a table, by name
    pub async fn list_partitions(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(
                "SELECT c.relname::text AS name
                 FROM pg_inherits i
                 JOIN pg_class c ON c.oid = i.inhrelid
                 JOIN pg_class p ON p.oid = i.inhparent
                 JOIN pg_namespace n ON n.oid = p.relnamespace
                 WHERE n.nspname = $1 AND p.relname = $2
                 ORDER BY c.relname",
                &[SqlValue::from(schema), SqlValue::from(table)],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
            .collect()
    }

    /// Size, row and ANALYZE statistics of a table's partitions
    pub async fn get_table_metrics(&self, schema: &str, table: &str) -> Result<TableMetrics> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(
                "SELECT c.relname::text AS name,
                        pg_total_relation_size(c.oid) AS size_bytes,
                        c.reltuples::bigint AS rows,
                        GREATEST(s.last_analyze, s.last_autoanalyze) AS last_analyzed
                 FROM pg_inherits i
                 JOIN pg_class c ON c.oid = i.inhrelid
                 JOIN pg_class p ON p.oid = i.inhparent
                 JOIN pg_namespace n ON n.oid = p.relnamespace
                 LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
                 WHERE n.nspname = $1 AND p.relname = $2",
                &[SqlValue::from(schema), SqlValue::from(table)],
            )
            .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            partitions.push(PartitionStat {
                name: row.try_get("name")?,
                size_bytes: row.try_get("size_bytes")?,
                rows: row.try_get("rows")?,
                last_analyzed: row.try_get("last_analyzed")?,
            });
        }
        Ok(summarize(schema, table, partitions, Utc::now()))
    }
}

/// Create partitions one statement at a time, skipping conflicts
async fn create_partitions(
    pool: &ModulePool,
    schema: &str,
    parent: &str,
    specs: &[PartitionSpec],
) -> Result<PartitionReport> {
    let mut report = PartitionReport::default();
    let mut conn = pool.acquire().await?;

    for spec in specs {
        let sql = spec.create_sql(schema, parent)?;
        match sqlx::query(&sql).execute(&mut *conn).await {
            Ok(_) => report.created.push(spec.name.clone()),
            Err(e) if is_partition_conflict(&e) => {
                let conflict = TenantForgeError::PartitionConflict {
                    table: format!("{}.{}", schema, parent),
                    partition: spec.name.clone(),
                };
                warn!(error = %conflict, "partition skipped");
                report.conflicts.push(spec.name.clone());
            }
            Err(e) => return Err(TenantForgeError::query(pool.name(), 0, e)),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_config_rejects_oversized_windows() {
        let mut config = PartitionConfig::new("module_vendas", "pedidos", "criado_em", PartitionStrategy::RangeDate);
        assert!(config.validate().is_ok());

        config.look_ahead = u32::MAX;
        assert!(matches!(config.validate(), Err(TenantForgeError::InvalidInput(_))));

        config.look_ahead = 3;
        config.retention_months = Some(3_000_000_000);
        assert!(matches!(config.validate(), Err(TenantForgeError::InvalidInput(_))));

        config.retention_months = Some(plan::MAX_PLANNING_MONTHS);
        assert!(config.validate().is_ok());
    }

    fn stat(name: &str, size: i64, analyzed_days_ago: Option<i64>, now: DateTime<Utc>) -> PartitionStat {
        PartitionStat {
            name: name.to_string(),
            size_bytes: size,
            rows: size / 100,
            last_analyzed: analyzed_days_ago.map(|d| now - ChronoDuration::days(d)),
        }
    }

    #[test]
    fn test_summarize_metrics() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let metrics = summarize(
            "module_vendas",
            "pedidos",
            vec![
                stat("pedidos_p2024_05", 5_000, Some(1), now),
                stat("pedidos_p2024_04", 9_000, Some(10), now),
                stat("pedidos_default", 100, None, now),
                stat("pedidos_p2024_06", 0, Some(0), now),
            ],
            now,
        );

        assert_eq!(metrics.partition_count, 4);
        assert_eq!(metrics.total_size_bytes, 14_100);
        assert_eq!(metrics.oldest_partition.as_deref(), Some("pedidos_p2024_04"));
        assert_eq!(metrics.newest_partition.as_deref(), Some("pedidos_p2024_06"));
        assert_eq!(metrics.largest_partition.as_deref(), Some("pedidos_p2024_04"));
        assert_eq!(metrics.needs_maintenance, vec!["pedidos_default", "pedidos_p2024_04"]);
    }

    #[test]
    fn test_summarize_empty() {
        let metrics = summarize("s", "t", Vec::new(), Utc::now());
        assert_eq!(metrics.partition_count, 0);
        assert!(metrics.oldest_partition.is_none());
        assert!(metrics.needs_maintenance.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let config = PartitionConfig::new("module_vendas", "t", "id", PartitionStrategy::Hash { partitions: 4 });
        assert!(config.validate().is_ok());

        let bad = PartitionConfig::new("module_vendas", "t;x", "id", PartitionStrategy::RangeDate);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        assert!(!is_partition_conflict(&sqlx::Error::PoolTimedOut));
    }
}
