//! Row-level policy primitives
//!
//! Shared by the isolation manager (default tenant policies on every
//! isolated table) and the security manager (table-scoped configurations
//! with custom policies).

use crate::database::schema::{qualified, quote_ident, validate_identifier};
use crate::error::{Result, TenantForgeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session setting holding the active tenant
pub const TENANT_SETTING: &str = "app.current_tenant";

/// Statement class a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyOperation {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl PolicyOperation {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PolicyOperation::Select => "SELECT",
            PolicyOperation::Insert => "INSERT",
            PolicyOperation::Update => "UPDATE",
            PolicyOperation::Delete => "DELETE",
            PolicyOperation::All => "ALL",
        }
    }

    /// INSERT policies take only `WITH CHECK`; SELECT and DELETE only `USING`
    fn accepts_using(&self) -> bool {
        !matches!(self, PolicyOperation::Insert)
    }

    fn accepts_with_check(&self) -> bool {
        !matches!(self, PolicyOperation::Select | PolicyOperation::Delete)
    }
}

impl fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for PolicyOperation {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SELECT" => Ok(PolicyOperation::Select),
            "INSERT" => Ok(PolicyOperation::Insert),
            "UPDATE" => Ok(PolicyOperation::Update),
            "DELETE" => Ok(PolicyOperation::Delete),
            "ALL" => Ok(PolicyOperation::All),
            other => Err(TenantForgeError::InvalidInput(format!(
                "unknown policy operation: {}",
                other
            ))),
        }
    }
}

/// One row-level security policy on a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub operation: PolicyOperation,
    /// Roles the policy applies to; empty means `PUBLIC`
    pub roles: Vec<String>,
    pub using: Option<String>,
    pub with_check: Option<String>,
}

impl SecurityPolicy {
    pub fn new(
        name: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        operation: PolicyOperation,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            table: table.into(),
            operation,
            roles: Vec::new(),
            using: None,
            with_check: None,
        }
    }

    pub fn using(mut self, predicate: impl Into<String>) -> Self {
        self.using = Some(predicate.into());
        self
    }

    pub fn with_check(mut self, predicate: impl Into<String>) -> Self {
        self.with_check = Some(predicate.into());
        self
    }

    pub fn to_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// `CREATE POLICY` statement
    pub fn create_sql(&self) -> Result<String> {
        let mut sql = format!(
            "CREATE POLICY {} ON {} FOR {} TO {}",
            quote_ident(&self.name)?,
            qualified(&self.schema, &self.table)?,
            self.operation,
            self.roles_sql()?
        );

        match (&self.using, self.operation.accepts_using()) {
            (Some(predicate), true) => sql.push_str(&format!(" USING ({})", predicate)),
            (Some(_), false) => {
                return Err(self.invalid("INSERT policies cannot have a USING clause"))
            }
            (None, _) => {}
        }
        match (&self.with_check, self.operation.accepts_with_check()) {
            (Some(predicate), true) => sql.push_str(&format!(" WITH CHECK ({})", predicate)),
            (Some(_), false) => {
                return Err(self.invalid("SELECT/DELETE policies cannot have a WITH CHECK clause"))
            }
            (None, _) => {}
        }
        if self.using.is_none() && self.with_check.is_none() {
            return Err(self.invalid("policy needs a USING or WITH CHECK predicate"));
        }
        Ok(sql)
    }

    /// `DROP POLICY IF EXISTS` statement
    pub fn drop_sql(&self) -> Result<String> {
        drop_policy_sql(&self.name, &self.schema, &self.table)
    }

    fn roles_sql(&self) -> Result<String> {
        if self.roles.is_empty() {
            return Ok("PUBLIC".to_string());
        }
        self.roles
            .iter()
            .map(|role| match role.to_uppercase().as_str() {
                "PUBLIC" | "CURRENT_USER" | "SESSION_USER" => Ok(role.to_uppercase()),
                _ => quote_ident(role),
            })
            .collect::<Result<Vec<_>>>()
            .map(|roles| roles.join(", "))
    }

    fn invalid(&self, message: &str) -> TenantForgeError {
        TenantForgeError::policy(&self.schema, &self.table, format!("{}: {}", self.name, message))
    }
}

/// `DROP POLICY IF EXISTS` for an arbitrary policy name
pub fn drop_policy_sql(name: &str, schema: &str, table: &str) -> Result<String> {
    Ok(format!(
        "DROP POLICY IF EXISTS {} ON {}",
        quote_ident(name)?,
        qualified(schema, table)?
    ))
}

/// Predicate comparing the tenant column with the session tenant
pub fn tenant_predicate(tenant_column: &str) -> Result<String> {
    Ok(format!(
        "{} = current_setting('{}', true)",
        quote_ident(tenant_column)?,
        TENANT_SETTING
    ))
}

/// Default tenant-scoped CRUD policies for a table
pub fn tenant_policies(schema: &str, table: &str, tenant_column: &str) -> Result<Vec<SecurityPolicy>> {
    validate_identifier(table)?;
    let predicate = tenant_predicate(tenant_column)?;
    let name = |op: &str| format!("{}_tenant_{}", table, op);

    Ok(vec![
        SecurityPolicy::new(name("select"), schema, table, PolicyOperation::Select)
            .using(predicate.clone()),
        SecurityPolicy::new(name("insert"), schema, table, PolicyOperation::Insert)
            .with_check(predicate.clone()),
        SecurityPolicy::new(name("update"), schema, table, PolicyOperation::Update)
            .using(predicate.clone())
            .with_check(predicate.clone()),
        SecurityPolicy::new(name("delete"), schema, table, PolicyOperation::Delete)
            .using(predicate),
    ])
}

/// Permissive policy letting a trusted role bypass tenant isolation
pub fn service_policy(schema: &str, table: &str, role: &str) -> SecurityPolicy {
    SecurityPolicy::new(format!("{}_service_bypass", table), schema, table, PolicyOperation::All)
        .to_roles([role])
        .using("true")
        .with_check("true")
}

/// Enable and force row-level security (owners are subject too)
pub fn enable_rls_sql(schema: &str, table: &str) -> Result<String> {
    let target = qualified(schema, table)?;
    Ok(format!(
        "ALTER TABLE {target} ENABLE ROW LEVEL SECURITY;\nALTER TABLE {target} FORCE ROW LEVEL SECURITY;"
    ))
}

/// Create a `NOLOGIN` role when it does not exist yet
pub fn ensure_role_sql(role: &str) -> Result<String> {
    validate_identifier(role)?;
    Ok(format!(
        "DO $$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN CREATE ROLE \"{role}\" NOLOGIN; END IF; END $$;"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_policy_sql() {
        let policies = tenant_policies("module_vendas", "clientes", "organization_id").unwrap();
        assert_eq!(policies.len(), 4);

        let select = policies[0].create_sql().unwrap();
        assert_eq!(
            select,
            "CREATE POLICY \"clientes_tenant_select\" ON \"module_vendas\".\"clientes\" FOR SELECT TO PUBLIC \
             USING (\"organization_id\" = current_setting('app.current_tenant', true))"
        );

        let insert = policies[1].create_sql().unwrap();
        assert!(insert.contains("FOR INSERT"));
        assert!(insert.contains("WITH CHECK"));
        assert!(!insert.contains("USING"));
    }

    #[test]
    fn test_service_policy_roles() {
        let sql = service_policy("module_vendas", "clientes", "platform_service")
            .create_sql()
            .unwrap();
        assert!(sql.contains("FOR ALL TO \"platform_service\" USING (true) WITH CHECK (true)"));
    }

    #[test]
    fn test_invalid_clause_combinations() {
        let insert_using = SecurityPolicy::new("p", "s", "t", PolicyOperation::Insert).using("true");
        assert!(insert_using.create_sql().is_err());

        let empty = SecurityPolicy::new("p", "s", "t", PolicyOperation::Select);
        assert!(empty.create_sql().is_err());
    }

    #[test]
    fn test_drop_sql_quotes_names() {
        let policy = SecurityPolicy::new("clientes_tenant_select", "module_vendas", "clientes", PolicyOperation::Select);
        assert_eq!(
            policy.drop_sql().unwrap(),
            "DROP POLICY IF EXISTS \"clientes_tenant_select\" ON \"module_vendas\".\"clientes\""
        );
    }

    #[test]
    fn test_rejects_bad_role() {
        let policy = SecurityPolicy::new("p", "s", "t", PolicyOperation::All)
            .to_roles(["admin; DROP ROLE x"])
            .using("true");
        assert!(policy.create_sql().is_err());
        assert!(ensure_role_sql("bad role").is_err());
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("delete".parse::<PolicyOperation>().unwrap(), PolicyOperation::Delete);
        assert!("merge".parse::<PolicyOperation>().is_err());
    }
}
