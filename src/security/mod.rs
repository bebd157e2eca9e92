//! Security & Audit Manager
//!
//! Table-scoped row-level security with custom policies, trigger-based
//! audit trails, an access log, suspicious-activity detection and
//! compliance reports.

pub mod anomaly;
pub mod audit;
pub mod policy;

pub use anomaly::{ComplianceReport, Heuristic, SecurityAlert, Severity};
pub use audit::{AccessEvent, AccessKind, AuditConfig, AuditEntry};
pub use policy::{PolicyOperation, SecurityPolicy};

use crate::database::connection::PoolManager;
use crate::database::schema::{qualified, validate_identifier};
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub(crate) const PLATFORM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS platform.security_policies (
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    definition JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (schema_name, table_name, policy_name)
);
CREATE TABLE IF NOT EXISTS platform.access_log (
    id BIGSERIAL PRIMARY KEY,
    user_id TEXT,
    tenant_id TEXT,
    module_name TEXT,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    row_count BIGINT NOT NULL DEFAULT 0,
    detail TEXT,
    occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS access_log_occurred_idx ON platform.access_log (occurred_at);
CREATE TABLE IF NOT EXISTS platform.security_alerts (
    id BIGSERIAL PRIMARY KEY,
    heuristic TEXT NOT NULL,
    severity TEXT NOT NULL,
    user_id TEXT,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    event_count BIGINT NOT NULL,
    window_start TIMESTAMPTZ NOT NULL,
    detected_at TIMESTAMPTZ NOT NULL,
    description TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS platform.compliance_reports (
    id BIGSERIAL PRIMARY KEY,
    period_start TIMESTAMPTZ NOT NULL,
    period_end TIMESTAMPTZ NOT NULL,
    report JSONB NOT NULL,
    generated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Row-level security configuration of one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRlsConfig {
    pub schema: String,
    pub table: String,
    /// Column compared with `app.current_tenant`; `None` skips the default
    /// tenant policies
    pub tenant_column: Option<String>,
    pub custom_policies: Vec<SecurityPolicy>,
    /// Role given a permissive bypass policy
    pub service_role: Option<String>,
}

impl TableRlsConfig {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            tenant_column: Some("organization_id".to_string()),
            custom_policies: Vec::new(),
            service_role: None,
        }
    }

    pub fn tenant_column(mut self, column: Option<&str>) -> Self {
        self.tenant_column = column.map(str::to_string);
        self
    }

    pub fn policy(mut self, policy: SecurityPolicy) -> Self {
        self.custom_policies.push(policy);
        self
    }

    pub fn service_role(mut self, role: impl Into<String>) -> Self {
        self.service_role = Some(role.into());
        self
    }

    /// Every policy the table ends up with, in creation order
    pub fn policies(&self) -> Result<Vec<SecurityPolicy>> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.table)?;

        let mut policies = match &self.tenant_column {
            Some(column) => policy::tenant_policies(&self.schema, &self.table, column)?,
            None => Vec::new(),
        };
        for custom in &self.custom_policies {
            if custom.schema != self.schema || custom.table != self.table {
                return Err(TenantForgeError::policy(
                    &self.schema,
                    &self.table,
                    format!("policy {} targets {}.{}", custom.name, custom.schema, custom.table),
                ));
            }
            policies.push(custom.clone());
        }
        if let Some(role) = &self.service_role {
            policies.push(policy::service_policy(&self.schema, &self.table, role));
        }

        let mut names: Vec<&str> = policies.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(TenantForgeError::policy(
                &self.schema,
                &self.table,
                "duplicate policy names",
            ));
        }
        Ok(policies)
    }
}

pub struct SecurityManager {
    pools: Arc<PoolManager>,
}

impl SecurityManager {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    /// Replace every policy on a table.
    ///
    /// Existing policies are dropped and the new set created in the same
    /// transaction, so readers never see a partial policy set.
    #[instrument(skip_all, fields(schema = %config.schema, table = %config.table))]
    pub async fn configure_table_rls(&self, config: TableRlsConfig) -> Result<Vec<SecurityPolicy>> {
        let policies = config.policies()?;
        let enable = policy::enable_rls_sql(&config.schema, &config.table)?;
        let creates = policies
            .iter()
            .map(SecurityPolicy::create_sql)
            .collect::<Result<Vec<_>>>()?;
        let records = policies
            .iter()
            .map(|p| -> Result<(String, &'static str, serde_json::Value)> {
                Ok((p.name.clone(), p.operation.as_sql(), serde_json::to_value(p)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = self.pools.default_pool().await?;
        let schema = config.schema.clone();
        let table = config.table.clone();

        let outcome = pool
            .transaction(move |conn| {
                Box::pin(async move {
                    sqlx::raw_sql(&enable).execute(&mut *conn).await?;

                    let existing: Vec<String> = sqlx::query_scalar(
                        "SELECT policyname::text FROM pg_policies WHERE schemaname = $1 AND tablename = $2",
                    )
                    .bind(&schema)
                    .bind(&table)
                    .fetch_all(&mut *conn)
                    .await?;
                    for name in &existing {
                        let drop = policy::drop_policy_sql(name, &schema, &table)?;
                        sqlx::query(&drop).execute(&mut *conn).await?;
                    }

                    for create in &creates {
                        sqlx::query(create).execute(&mut *conn).await?;
                    }

                    sqlx::query(
                        "DELETE FROM platform.security_policies WHERE schema_name = $1 AND table_name = $2",
                    )
                    .bind(&schema)
                    .bind(&table)
                    .execute(&mut *conn)
                    .await?;
                    for (name, operation, definition) in records {
                        sqlx::query(
                            "INSERT INTO platform.security_policies (schema_name, table_name, policy_name, operation, definition)
                             VALUES ($1, $2, $3, $4, $5)",
                        )
                        .bind(&schema)
                        .bind(&table)
                        .bind(name)
                        .bind(operation)
                        .bind(sqlx::types::Json(definition))
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(existing.len())
                })
            })
            .await;

        match outcome {
            Ok(dropped) => {
                info!(dropped, created = policies.len(), "row-level security configured");
                Ok(policies)
            }
            Err(e @ TenantForgeError::PolicyCreation { .. }) => Err(e),
            Err(e) => Err(TenantForgeError::policy(
                &config.schema,
                &config.table,
                e.sanitized_message(),
            )),
        }
    }

    /// Policies last configured for a table
    pub async fn policies(&self, schema: &str, table: &str) -> Result<Vec<SecurityPolicy>> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(
                "SELECT definition FROM platform.security_policies
                 WHERE schema_name = $1 AND table_name = $2 ORDER BY created_at, policy_name",
                &[SqlValue::from(schema), SqlValue::from(table)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let definition: sqlx::types::Json<SecurityPolicy> = row.try_get("definition")?;
                Ok(definition.0)
            })
            .collect()
    }

    /// Install the audit table and trigger for a table
    #[instrument(skip_all, fields(schema = %config.schema, table = %config.table))]
    pub async fn configure_table_audit(&self, config: AuditConfig) -> Result<String> {
        let statements = audit::audit_table_sql(&config, Utc::now())?;
        let pool = self.pools.default_pool().await?;
        crate::isolation::run_statements(&pool, statements).await?;

        let audit_table = format!("{}.{}", audit::AUDIT_SCHEMA, config.audit_table());
        info!(audit_table = %audit_table, "audit trail configured");
        Ok(audit_table)
    }

    /// Most recent audit entries of a table, optionally for one record
    pub async fn audit_trail(
        &self,
        schema: &str,
        table: &str,
        record_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>> {
        let config = AuditConfig::new(schema, table);
        validate_identifier(schema)?;
        validate_identifier(table)?;
        let sql = format!(
            "SELECT audit_id, record_id, operation, old_data, new_data, changed_columns, changed_by,
                    session_id, client_ip, user_agent, changed_at
             FROM {}
             WHERE ($1::text IS NULL OR record_id = $1)
             ORDER BY changed_at DESC, audit_id DESC
             LIMIT $2",
            qualified(audit::AUDIT_SCHEMA, &config.audit_table())?
        );

        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(&sql, &[SqlValue::from(record_id), SqlValue::Int(limit.max(1))])
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let changed_columns: Option<Vec<String>> = row.try_get("changed_columns")?;
            entries.push(AuditEntry {
                audit_id: row.try_get("audit_id")?,
                record_id: row.try_get("record_id")?,
                operation: row.try_get("operation")?,
                old_data: row.try_get("old_data")?,
                new_data: row.try_get("new_data")?,
                changed_columns: changed_columns.unwrap_or_default(),
                changed_by: row.try_get("changed_by")?,
                session_id: row.try_get("session_id")?,
                client_ip: row.try_get("client_ip")?,
                user_agent: row.try_get("user_agent")?,
                changed_at: row.try_get("changed_at")?,
            });
        }
        Ok(entries)
    }

    /// Append an access event to the access log
    pub async fn record_access(&self, event: &AccessEvent) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute(
            "INSERT INTO platform.access_log
                (user_id, tenant_id, module_name, schema_name, table_name, kind, success, row_count, detail, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                SqlValue::from(event.user_id.clone()),
                SqlValue::from(event.tenant_id.clone()),
                SqlValue::from(event.module_name.clone()),
                SqlValue::from(event.schema_name.as_str()),
                SqlValue::from(event.table_name.as_str()),
                SqlValue::from(event.kind.as_str()),
                SqlValue::Bool(event.success),
                SqlValue::Int(event.row_count),
                SqlValue::from(event.detail.clone()),
                SqlValue::Timestamp(event.occurred_at),
            ],
        )
        .await?;
        Ok(())
    }

    /// Run every heuristic over the access log and persist the alerts raised
    #[instrument(skip(self))]
    pub async fn detect_suspicious_activity(&self) -> Result<Vec<SecurityAlert>> {
        let pool = self.pools.default_pool().await?;
        let now = Utc::now();
        let mut alerts = Vec::new();

        for heuristic in Heuristic::ALL {
            let sql = format!(
                "SELECT user_id, schema_name, table_name, count(*) AS events
                 FROM platform.access_log
                 WHERE {} AND occurred_at >= $1
                 GROUP BY user_id, schema_name, table_name
                 HAVING count(*) > $2",
                heuristic.filter_sql()
            );
            let rows = pool
                .query(
                    &sql,
                    &[
                        SqlValue::Timestamp(now - heuristic.window()),
                        SqlValue::Int(heuristic.threshold()),
                    ],
                )
                .await?;

            for row in rows {
                let alert = SecurityAlert::evaluate(
                    heuristic,
                    row.try_get("user_id")?,
                    row.try_get("schema_name")?,
                    row.try_get("table_name")?,
                    row.try_get("events")?,
                    now,
                );
                if let Some(alert) = alert {
                    warn!(
                        heuristic = heuristic.as_str(),
                        severity = %alert.severity,
                        table = %alert.table_name,
                        events = alert.event_count,
                        "suspicious activity"
                    );
                    alerts.push(alert);
                }
            }
        }

        for alert in &alerts {
            pool.execute(
                "INSERT INTO platform.security_alerts
                    (heuristic, severity, user_id, schema_name, table_name, event_count, window_start, detected_at, description)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    SqlValue::from(alert.heuristic.as_str()),
                    SqlValue::from(alert.severity.as_str()),
                    SqlValue::from(alert.user_id.clone()),
                    SqlValue::from(alert.schema_name.as_str()),
                    SqlValue::from(alert.table_name.as_str()),
                    SqlValue::Int(alert.event_count),
                    SqlValue::Timestamp(alert.window_start),
                    SqlValue::Timestamp(alert.detected_at),
                    SqlValue::from(alert.description.as_str()),
                ],
            )
            .await?;
        }
        Ok(alerts)
    }

    /// Aggregate access counts over `[start, end)` into a persisted report
    #[instrument(skip(self))]
    pub async fn generate_compliance_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ComplianceReport> {
        if start >= end {
            return Err(TenantForgeError::InvalidInput(format!(
                "report period start {} is not before end {}",
                start, end
            )));
        }

        let pool = self.pools.default_pool().await?;
        let window = [SqlValue::Timestamp(start), SqlValue::Timestamp(end)];
        let rows = pool
            .query(
                "SELECT count(*) FILTER (WHERE kind = 'read') AS reads,
                        count(*) FILTER (WHERE kind = 'write') AS writes,
                        count(*) FILTER (WHERE kind = 'delete') AS deletes,
                        count(*) FILTER (WHERE kind = 'privileged') AS privileged,
                        count(*) FILTER (WHERE success = false) AS failed,
                        count(DISTINCT user_id) AS users,
                        (SELECT count(*) FROM platform.security_alerts
                          WHERE detected_at >= $1 AND detected_at < $2) AS alerts
                 FROM platform.access_log
                 WHERE occurred_at >= $1 AND occurred_at < $2",
                &window,
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| TenantForgeError::NotFound("compliance aggregate".to_string()))?;

        let report = ComplianceReport {
            period_start: start,
            period_end: end,
            read_count: row.try_get("reads")?,
            write_count: row.try_get("writes")?,
            delete_count: row.try_get("deletes")?,
            privileged_count: row.try_get("privileged")?,
            failed_count: row.try_get("failed")?,
            distinct_users: row.try_get("users")?,
            alert_count: row.try_get("alerts")?,
            generated_at: Utc::now(),
        };

        pool.execute(
            "INSERT INTO platform.compliance_reports (period_start, period_end, report) VALUES ($1, $2, $3)",
            &[
                SqlValue::Timestamp(start),
                SqlValue::Timestamp(end),
                SqlValue::Json(serde_json::to_value(&report)?),
            ],
        )
        .await?;
        info!(total = report.total_accesses(), failed = report.failed_count, "compliance report generated");
        Ok(report)
    }

    /// Delete access-log rows older than `retention_days`
    pub async fn cleanup_audit_logs(&self, retention_days: u32) -> Result<u64> {
        let pool = self.pools.default_pool().await?;
        let deleted = pool
            .execute(
                "DELETE FROM platform.access_log WHERE occurred_at < now() - make_interval(days => $1)",
                &[SqlValue::Int(i64::from(retention_days))],
            )
            .await?;
        info!(deleted, retention_days, "access log pruned");
        Ok(deleted)
    }
}
