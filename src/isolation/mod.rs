//! Module Isolation Manager
//!
//! Gives every module a private schema, creates tenant-isolated tables in
//! it (control columns, row-level policies, audit and `updated_at`
//! triggers), binds tenant context on connections and enforces per-module
//! data retention.

pub mod ddl;
pub mod tenant;

pub use ddl::IsolatedTableSpec;
pub use tenant::{SettingScope, TenantContext};

use crate::config::IsolationSettings;
use crate::database::connection::{ModulePool, PoolManager};
use crate::database::indexer;
use crate::database::registry::schema_name_for;
use crate::database::schema::{qualified, quote_ident, validate_identifier, Column};
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use crate::partition::PartitionMethod;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Isolation settings of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub module_name: String,
    pub schema_name: String,
    pub tenant_column: String,
    pub enable_rls: bool,
    pub enable_audit: bool,
    /// Rows older than this many days are deleted by `cleanup_expired_data`
    pub retention_days: Option<u32>,
    /// Partitioning method used when a table names a partition column
    pub partition_strategy: Option<PartitionMethod>,
}

impl IsolationConfig {
    /// Defaults: schema `module_<name>`, tenant column `organization_id`,
    /// RLS and audit on, no retention
    pub fn new(module: impl Into<String>) -> Self {
        let module_name = module.into();
        Self {
            schema_name: schema_name_for(&module_name),
            module_name,
            tenant_column: "organization_id".to_string(),
            enable_rls: true,
            enable_audit: true,
            retention_days: None,
            partition_strategy: None,
        }
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.module_name)?;
        validate_identifier(&self.schema_name)?;
        validate_identifier(&self.tenant_column)?;
        if self.retention_days == Some(0) {
            return Err(TenantForgeError::InvalidInput(
                "retention_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-table overrides for [`IsolationManager::create_isolated_table`]
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    /// Overrides the module's RLS setting
    pub enable_rls: Option<bool>,
    /// Overrides the module's audit setting
    pub enable_audit: Option<bool>,
    /// Partition the table by this column
    pub partition_column: Option<String>,
    /// Overrides the module's partitioning method
    pub partition_method: Option<PartitionMethod>,
}

/// Rows removed from one table by retention cleanup
#[derive(Debug, Clone, Serialize)]
pub struct TableCleanup {
    pub module: String,
    pub table: String,
    pub deleted: u64,
}

/// A module whose cleanup failed
#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub module: String,
    pub error: String,
}

/// Outcome of [`IsolationManager::cleanup_expired_data`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub tables: Vec<TableCleanup>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted).sum()
    }
}

pub struct IsolationManager {
    pools: Arc<PoolManager>,
    settings: IsolationSettings,
    configs: RwLock<HashMap<String, IsolationConfig>>,
}

impl IsolationManager {
    pub fn new(pools: Arc<PoolManager>, settings: IsolationSettings) -> Self {
        Self {
            pools,
            settings,
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Create the organization table if the deployment has none
    pub async fn ensure_organization_table(&self) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute_script(&ddl::organization_table_sql(&self.settings.organization_table)?)
            .await
    }

    /// Create the module schema, grant baseline privileges and record the config
    #[instrument(skip_all, fields(module = %config.module_name))]
    pub async fn register_module(&self, config: IsolationConfig) -> Result<()> {
        config.validate()?;
        let pool = self.pools.pool(&config.module_name).await?;

        pool.execute_script(&ddl::module_schema_sql(
            &config.schema_name,
            &self.settings.service_role,
        )?)
        .await?;
        if let Err(e) = pool
            .execute_script(&ddl::service_membership_sql(&self.settings.service_role)?)
            .await
        {
            warn!(error = %e, "could not grant service role membership");
        }

        info!(schema = %config.schema_name, rls = config.enable_rls, audit = config.enable_audit, "module schema ready");
        self.configs
            .write()
            .await
            .insert(config.module_name.clone(), config);
        Ok(())
    }

    /// Record a config without touching the database (restored registrations)
    pub async fn restore_config(&self, config: IsolationConfig) {
        self.configs
            .write()
            .await
            .insert(config.module_name.clone(), config);
    }

    /// Forget a module's config
    pub async fn forget_module(&self, module: &str) -> Option<IsolationConfig> {
        self.configs.write().await.remove(module)
    }

    pub async fn config(&self, module: &str) -> Result<IsolationConfig> {
        self.configs
            .read()
            .await
            .get(module)
            .cloned()
            .ok_or_else(|| TenantForgeError::ModuleNotRegistered(module.to_string()))
    }

    pub async fn configs(&self) -> Vec<IsolationConfig> {
        let mut configs: Vec<_> = self.configs.read().await.values().cloned().collect();
        configs.sort_by(|a, b| a.module_name.cmp(&b.module_name));
        configs
    }

    /// Create a tenant-isolated table in the module schema.
    ///
    /// Runs as one transaction: the table, its indexes, policies and
    /// triggers appear together or not at all.
    #[instrument(skip_all, fields(module = %module, table = %table))]
    pub async fn create_isolated_table(
        &self,
        module: &str,
        table: &str,
        columns: &[Column],
        options: TableOptions,
    ) -> Result<()> {
        let config = self.config(module).await?;
        validate_identifier(table)?;

        let method = options
            .partition_method
            .or(config.partition_strategy)
            .unwrap_or(PartitionMethod::Range);
        let spec = IsolatedTableSpec {
            schema: &config.schema_name,
            table,
            tenant_column: &config.tenant_column,
            organization_table: &self.settings.organization_table,
            columns,
            partition: options.partition_column.as_deref().map(|c| (method, c)),
        };

        let mut statements = ddl::create_table_sql(&spec)?;
        statements.extend(ddl::standard_indexes_sql(
            &config.schema_name,
            table,
            &config.tenant_column,
        )?);
        statements.push(ddl::grant_table_sql(
            &config.schema_name,
            table,
            &self.settings.service_role,
        )?);
        if options.enable_rls.unwrap_or(config.enable_rls) {
            statements.extend(ddl::rls_sql(
                &config.schema_name,
                table,
                &config.tenant_column,
                &self.settings.service_role,
            )?);
        }
        if options.enable_audit.unwrap_or(config.enable_audit) {
            statements.extend(ddl::audit_sql(&config.schema_name, table, &config.tenant_column)?);
        }
        statements.extend(ddl::touch_trigger_sql(&config.schema_name, table)?);

        let pool = self.pools.pool(module).await?;
        run_statements(&pool, statements).await?;
        info!("isolated table created");
        Ok(())
    }

    /// Bind `ctx` for the current transaction on `conn`
    pub async fn set_tenant_context(&self, conn: &mut PgConnection, ctx: &TenantContext) -> Result<()> {
        ctx.apply(conn, SettingScope::Transaction).await
    }

    /// Delete rows past each module's retention window.
    ///
    /// Audit tables are never touched. A failing module is recorded in the
    /// report and the remaining modules are still processed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_data(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for config in self.configs().await {
            let Some(days) = config.retention_days else {
                continue;
            };
            match self.cleanup_module(&config, days).await {
                Ok(tables) => {
                    for entry in &tables {
                        info!(module = %entry.module, table = %entry.table, deleted = entry.deleted, "expired rows removed");
                    }
                    report.tables.extend(tables);
                }
                Err(e) => {
                    warn!(module = %config.module_name, error = %e, "retention cleanup failed");
                    report.failures.push(CleanupFailure {
                        module: config.module_name.clone(),
                        error: e.sanitized_message(),
                    });
                }
            }
        }
        report
    }

    async fn cleanup_module(&self, config: &IsolationConfig, days: u32) -> Result<Vec<TableCleanup>> {
        let pool = self.pools.pool(&config.module_name).await?;
        let tables = indexer::tables_with_column(pool.inner(), &config.schema_name, "created_at").await?;

        let mut results = Vec::new();
        for table in tables.into_iter().filter(|t| !t.ends_with("_audit")) {
            let delete = format!(
                "DELETE FROM {} WHERE \"created_at\" < now() - make_interval(days => $1)",
                qualified(&config.schema_name, &table)?
            );
            let set_role = format!("SET LOCAL ROLE {}", quote_ident(&self.settings.service_role)?);

            let deleted = pool
                .transaction(move |conn| {
                    Box::pin(async move {
                        sqlx::query(&set_role)
                            .execute(&mut *conn)
                            .await
                            .map_err(|e| TenantForgeError::query("cleanup", 0, e))?;
                        let done = SqlValue::Int(i64::from(days))
                            .bind_to(sqlx::query(&delete))
                            .execute(&mut *conn)
                            .await
                            .map_err(|e| TenantForgeError::query("cleanup", 0, e))?;
                        Ok(done.rows_affected())
                    })
                })
                .await?;

            results.push(TableCleanup {
                module: config.module_name.clone(),
                table,
                deleted,
            });
        }
        Ok(results)
    }
}

/// Run DDL statements in order inside one transaction
pub(crate) async fn run_statements(pool: &ModulePool, statements: Vec<String>) -> Result<()> {
    let name = pool.name().to_string();
    pool.transaction(move |conn| {
        Box::pin(async move {
            for statement in &statements {
                sqlx::raw_sql(statement)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| TenantForgeError::query(&name, 0, e))?;
            }
            Ok(())
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::events::EventBus;

    fn manager() -> IsolationManager {
        let pools = Arc::new(PoolManager::new(
            "postgres://localhost/platform",
            PoolSettings::default(),
            EventBus::default(),
        ));
        IsolationManager::new(pools, IsolationSettings::default())
    }

    #[test]
    fn test_config_defaults() {
        let config = IsolationConfig::new("vendas");
        assert_eq!(config.schema_name, "module_vendas");
        assert_eq!(config.tenant_column, "organization_id");
        assert!(config.enable_rls && config.enable_audit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = IsolationConfig::new("vendas").retention_days(0);
        assert!(config.validate().is_err());

        config.retention_days = Some(30);
        config.tenant_column = "org id".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_unknown_module_is_rejected() {
        let manager = manager();
        let err = manager
            .create_isolated_table("vendas", "clientes", &[], TableOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TenantForgeError::ModuleNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_restore_and_forget_config() {
        let manager = manager();
        manager.restore_config(IsolationConfig::new("vendas")).await;
        assert_eq!(manager.config("vendas").await.unwrap().module_name, "vendas");
        assert_eq!(manager.configs().await.len(), 1);

        manager.forget_module("vendas").await;
        assert!(manager.config("vendas").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_skips_modules_without_retention() {
        let manager = manager();
        manager.restore_config(IsolationConfig::new("vendas")).await;
        let report = manager.cleanup_expired_data().await;
        assert!(report.tables.is_empty());
        assert!(report.failures.is_empty());
    }
}
