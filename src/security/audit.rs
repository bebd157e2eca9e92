//! Table audit trails and access events

use crate::database::schema::{derived_identifier, qualified, quote_ident, validate_identifier};
use crate::error::{Result, TenantForgeError};
use crate::partition::plan::{default_partition, monthly_partition, month_start};
use crate::security::policy::PolicyOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema holding the audit tables
pub const AUDIT_SCHEMA: &str = "audit";

pub const SESSION_ID: &str = "app.session_id";
pub const CLIENT_IP: &str = "app.client_ip";
pub const USER_AGENT: &str = "app.user_agent";

/// Which table to audit and for which statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    pub schema: String,
    pub table: String,
    /// Any of INSERT, UPDATE, DELETE; `All` expands to the three
    pub operations: Vec<PolicyOperation>,
}

impl AuditConfig {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            operations: vec![PolicyOperation::All],
        }
    }

    pub fn operations(mut self, operations: impl IntoIterator<Item = PolicyOperation>) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }

    /// Trigger events in a stable order
    pub fn trigger_events(&self) -> Result<Vec<&'static str>> {
        let mut events = Vec::new();
        for operation in &self.operations {
            let expanded: &[&'static str] = match operation {
                PolicyOperation::All => &["INSERT", "UPDATE", "DELETE"],
                PolicyOperation::Insert => &["INSERT"],
                PolicyOperation::Update => &["UPDATE"],
                PolicyOperation::Delete => &["DELETE"],
                PolicyOperation::Select => {
                    return Err(TenantForgeError::InvalidInput(
                        "SELECT cannot be audited by a trigger".to_string(),
                    ))
                }
            };
            events.extend_from_slice(expanded);
        }
        let order = ["INSERT", "UPDATE", "DELETE"];
        events.sort_by_key(|e| order.iter().position(|o| o == e));
        events.dedup();
        if events.is_empty() {
            return Err(TenantForgeError::InvalidInput(format!(
                "no audit operations configured for {}.{}",
                self.schema, self.table
            )));
        }
        Ok(events)
    }

    /// Name of the audit table inside [`AUDIT_SCHEMA`]
    pub fn audit_table(&self) -> String {
        derived_identifier(&format!("{}__{}", self.schema, self.table), "")
    }
}

/// Statements installing the audit table, its partitions, the capture
/// function and the trigger
pub fn audit_table_sql(config: &AuditConfig, now: DateTime<Utc>) -> Result<Vec<String>> {
    validate_identifier(&config.schema)?;
    validate_identifier(&config.table)?;
    let events = config.trigger_events()?;

    let audit_name = config.audit_table();
    let audit_table = qualified(AUDIT_SCHEMA, &audit_name)?;
    let function = qualified(AUDIT_SCHEMA, &derived_identifier(&audit_name, "_fn"))?;
    let trigger = quote_ident(&derived_identifier(&config.table, "_audit_log"))?;
    let target = qualified(&config.schema, &config.table)?;
    let current_user = crate::isolation::tenant::CURRENT_USER;

    let mut statements = vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(AUDIT_SCHEMA)?),
        format!(
            "CREATE TABLE IF NOT EXISTS {audit_table} (\n    \
             \"audit_id\" BIGSERIAL,\n    \
             \"record_id\" TEXT,\n    \
             \"operation\" TEXT NOT NULL,\n    \
             \"old_data\" JSONB,\n    \
             \"new_data\" JSONB,\n    \
             \"changed_columns\" TEXT[],\n    \
             \"changed_by\" TEXT,\n    \
             \"session_id\" TEXT,\n    \
             \"client_ip\" TEXT,\n    \
             \"user_agent\" TEXT,\n    \
             \"changed_at\" TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
             PRIMARY KEY (\"audit_id\", \"changed_at\")\n\
             ) PARTITION BY RANGE (\"changed_at\")"
        ),
    ];

    for spec in [monthly_partition(&audit_name, month_start(now)), default_partition(&audit_name)] {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} {}",
            qualified(AUDIT_SCHEMA, &spec.name)?,
            audit_table,
            spec.bounds
        ));
    }

    statements.push(format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $fn$\n\
         DECLARE\n    \
         old_row JSONB;\n    \
         new_row JSONB;\n    \
         changed TEXT[];\n\
         BEGIN\n    \
         IF TG_OP <> 'INSERT' THEN old_row := to_jsonb(OLD); END IF;\n    \
         IF TG_OP <> 'DELETE' THEN new_row := to_jsonb(NEW); END IF;\n    \
         IF TG_OP = 'UPDATE' THEN\n        \
         SELECT array_agg(n.key ORDER BY n.key) INTO changed\n        \
         FROM jsonb_each(new_row) n\n        \
         WHERE n.value IS DISTINCT FROM old_row -> n.key;\n    \
         END IF;\n    \
         INSERT INTO {audit_table} (record_id, operation, old_data, new_data, changed_columns, changed_by, session_id, client_ip, user_agent)\n    \
         VALUES (\n        \
         COALESCE(new_row ->> 'id', old_row ->> 'id'), TG_OP, old_row, new_row, changed,\n        \
         NULLIF(current_setting('{current_user}', true), ''),\n        \
         NULLIF(current_setting('{SESSION_ID}', true), ''),\n        \
         NULLIF(current_setting('{CLIENT_IP}', true), ''),\n        \
         NULLIF(current_setting('{USER_AGENT}', true), '')\n    \
         );\n    \
         RETURN COALESCE(NEW, OLD);\n\
         END\n$fn$"
    ));
    statements.push(format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"));
    statements.push(format!(
        "CREATE TRIGGER {trigger} AFTER {} ON {target} FOR EACH ROW EXECUTE FUNCTION {function}()",
        events.join(" OR ")
    ));
    Ok(statements)
}

/// One captured change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: i64,
    pub record_id: Option<String>,
    pub operation: String,
    pub old_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
    pub changed_columns: Vec<String>,
    pub changed_by: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Class of a data access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    Delete,
    /// DDL, policy changes, service-role access
    Privileged,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Delete => "delete",
            AccessKind::Privileged => "privileged",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(AccessKind::Read),
            "write" => Ok(AccessKind::Write),
            "delete" => Ok(AccessKind::Delete),
            "privileged" => Ok(AccessKind::Privileged),
            other => Err(TenantForgeError::InvalidInput(format!("unknown access kind: {}", other))),
        }
    }
}

/// A data access to append to the access log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub module_name: Option<String>,
    pub schema_name: String,
    pub table_name: String,
    pub kind: AccessKind,
    pub success: bool,
    pub row_count: i64,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AccessEvent {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, kind: AccessKind) -> Self {
        Self {
            user_id: None,
            tenant_id: None,
            module_name: None,
            schema_name: schema.into(),
            table_name: table.into(),
            kind,
            success: true,
            row_count: 0,
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module_name = Some(module.into());
        self
    }

    pub fn rows(mut self, row_count: i64) -> Self {
        self.row_count = row_count;
        self
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.success = false;
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trigger_events_expand_and_order() {
        let config = AuditConfig::new("module_vendas", "pedidos")
            .operations([PolicyOperation::Delete, PolicyOperation::All, PolicyOperation::Insert]);
        assert_eq!(config.trigger_events().unwrap(), vec!["INSERT", "UPDATE", "DELETE"]);

        let select = AuditConfig::new("s", "t").operations([PolicyOperation::Select]);
        assert!(select.trigger_events().is_err());

        let none = AuditConfig::new("s", "t").operations([]);
        assert!(none.trigger_events().is_err());
    }

    #[test]
    fn test_audit_table_sql() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let config = AuditConfig::new("module_vendas", "pedidos")
            .operations([PolicyOperation::Update, PolicyOperation::Delete]);
        let statements = audit_table_sql(&config, now).unwrap();

        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS \"audit\"");
        assert!(statements[1].contains("\"audit\".\"module_vendas__pedidos\""));
        assert!(statements[1].contains("PARTITION BY RANGE (\"changed_at\")"));
        assert!(statements[2].contains("module_vendas__pedidos_p2024_03"));
        assert!(statements[2].contains("FROM ('2024-03-01') TO ('2024-04-01')"));
        assert!(statements[3].ends_with("DEFAULT"));
        assert!(statements[4].contains("app.session_id"));
        assert!(statements[4].contains("jsonb_each(new_row)"));
        assert!(statements
            .last()
            .unwrap()
            .contains("AFTER UPDATE OR DELETE ON \"module_vendas\".\"pedidos\""));
    }

    #[test]
    fn test_access_event_builder() {
        let event = AccessEvent::new("module_vendas", "pedidos", AccessKind::Read)
            .user(Some("u-1".to_string()))
            .rows(12)
            .failed("permission denied");
        assert!(!event.success);
        assert_eq!(event.row_count, 12);
        assert_eq!("privileged".parse::<AccessKind>().unwrap(), AccessKind::Privileged);
    }
}
