//! DDL generation for isolated modules and tables
//!
//! Pure functions; the manager decides when and in which transaction the
//! statements run.

use crate::database::schema::{
    derived_identifier, qualified, quote_ident, quote_path, validate_identifier, Column,
};
use crate::error::{Result, TenantForgeError};
use crate::isolation::tenant::{CURRENT_TENANT, CURRENT_USER};
use crate::partition::PartitionMethod;
use crate::security::policy::{self, SecurityPolicy};

/// Columns every isolated table carries
pub const CONTROL_COLUMNS: [&str; 5] = ["id", "created_at", "updated_at", "created_by", "updated_by"];

/// Everything needed to render one isolated table
#[derive(Debug, Clone)]
pub struct IsolatedTableSpec<'a> {
    pub schema: &'a str,
    pub table: &'a str,
    pub tenant_column: &'a str,
    pub organization_table: &'a str,
    pub columns: &'a [Column],
    pub partition: Option<(PartitionMethod, &'a str)>,
}

/// Schema creation plus baseline privileges for the service role
pub fn module_schema_sql(schema: &str, service_role: &str) -> Result<String> {
    let schema_q = quote_ident(schema)?;
    let role_q = quote_ident(service_role)?;
    Ok(format!(
        "{ensure_role}\n\
         CREATE SCHEMA IF NOT EXISTS {schema_q};\n\
         GRANT USAGE ON SCHEMA {schema_q} TO {role_q};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA {schema_q} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {role_q};",
        ensure_role = policy::ensure_role_sql(service_role)?,
    ))
}

/// Let the connecting user assume the service role; ignored when not permitted
pub fn service_membership_sql(service_role: &str) -> Result<String> {
    validate_identifier(service_role)?;
    Ok(format!(
        "DO $$ BEGIN EXECUTE 'GRANT \"{service_role}\" TO ' || quote_ident(current_user); \
         EXCEPTION WHEN others THEN RAISE NOTICE 'service role membership not granted: %', SQLERRM; END $$;"
    ))
}

/// Organization table referenced by tenant columns, created when missing
pub fn organization_table_sql(organization_table: &str) -> Result<String> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \"id\" TEXT PRIMARY KEY,\n    \"name\" TEXT,\n    \"created_at\" TIMESTAMPTZ NOT NULL DEFAULT now()\n);",
        quote_path(organization_table)?
    ))
}

/// `CREATE TABLE` with control columns prepended, plus a default partition
/// for range and list partitioning
pub fn create_table_sql(spec: &IsolatedTableSpec<'_>) -> Result<Vec<String>> {
    let target = qualified(spec.schema, spec.table)?;
    let tenant = quote_ident(spec.tenant_column)?;

    for column in spec.columns {
        if CONTROL_COLUMNS.contains(&column.name.as_str()) || column.name == spec.tenant_column {
            return Err(TenantForgeError::InvalidInput(format!(
                "column '{}' is managed by the platform",
                column.name
            )));
        }
    }

    let mut lines = vec![
        "\"id\" UUID NOT NULL DEFAULT gen_random_uuid()".to_string(),
        format!(
            "{} TEXT NOT NULL DEFAULT current_setting('{}', true) REFERENCES {} (\"id\")",
            tenant,
            CURRENT_TENANT,
            quote_path(spec.organization_table)?
        ),
    ];
    for column in spec.columns {
        lines.push(column.to_ddl()?);
    }
    lines.push("\"created_at\" TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());
    lines.push("\"updated_at\" TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());
    lines.push(format!(
        "\"created_by\" TEXT DEFAULT current_setting('{}', true)",
        CURRENT_USER
    ));
    lines.push(format!(
        "\"updated_by\" TEXT DEFAULT current_setting('{}', true)",
        CURRENT_USER
    ));

    let mut statements = Vec::new();
    match spec.partition {
        Some((method, column)) => {
            let column_q = quote_ident(column)?;
            let known = column == "created_at"
                || column == spec.tenant_column
                || spec.columns.iter().any(|c| c.name == column);
            if !known {
                return Err(TenantForgeError::InvalidInput(format!(
                    "partition column '{}' is not a column of {}",
                    column, spec.table
                )));
            }
            if column == "id" {
                lines.push("PRIMARY KEY (\"id\")".to_string());
            } else {
                lines.push(format!("PRIMARY KEY (\"id\", {})", column_q));
            }
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    {}\n) PARTITION BY {} ({})",
                target,
                lines.join(",\n    "),
                method.as_sql(),
                column_q
            ));
            if method.supports_default() {
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} DEFAULT",
                    qualified(spec.schema, &derived_identifier(spec.table, "_default"))?,
                    target
                ));
            }
        }
        None => {
            lines.push("PRIMARY KEY (\"id\")".to_string());
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
                target,
                lines.join(",\n    ")
            ));
        }
    }
    Ok(statements)
}

/// Indexes on the tenant column and `created_at`
pub fn standard_indexes_sql(schema: &str, table: &str, tenant_column: &str) -> Result<Vec<String>> {
    let target = qualified(schema, table)?;
    [tenant_column, "created_at"]
        .iter()
        .map(|column| {
            let name = derived_identifier(table, &format!("_{}_idx", column));
            Ok(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&name)?,
                target,
                quote_ident(column)?
            ))
        })
        .collect()
}

/// Privileges for the service role on one table
pub fn grant_table_sql(schema: &str, table: &str, service_role: &str) -> Result<String> {
    Ok(format!(
        "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {}",
        qualified(schema, table)?,
        quote_ident(service_role)?
    ))
}

/// The policies installed on an isolated table
pub fn isolation_policies(
    schema: &str,
    table: &str,
    tenant_column: &str,
    service_role: &str,
) -> Result<Vec<SecurityPolicy>> {
    let mut policies = policy::tenant_policies(schema, table, tenant_column)?;
    policies.push(policy::service_policy(schema, table, service_role));
    Ok(policies)
}

/// Enable RLS and (re)create the isolation policies
pub fn rls_sql(schema: &str, table: &str, tenant_column: &str, service_role: &str) -> Result<Vec<String>> {
    let mut statements = vec![policy::enable_rls_sql(schema, table)?];
    for policy in isolation_policies(schema, table, tenant_column, service_role)? {
        statements.push(policy.drop_sql()?);
        statements.push(policy.create_sql()?);
    }
    Ok(statements)
}

/// Sibling `<table>_audit` table, its trigger function and the row trigger
pub fn audit_sql(schema: &str, table: &str, tenant_column: &str) -> Result<Vec<String>> {
    let target = qualified(schema, table)?;
    let audit_table = qualified(schema, &derived_identifier(table, "_audit"))?;
    let function = qualified(schema, &derived_identifier(table, "_audit_fn"))?;
    let trigger = quote_ident(&derived_identifier(table, "_audit_trg"))?;
    let tenant = quote_ident(tenant_column)?;

    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {audit_table} (\n    \
             \"audit_id\" BIGSERIAL PRIMARY KEY,\n    \
             \"record_id\" UUID,\n    \
             \"operation\" TEXT NOT NULL,\n    \
             \"old_data\" JSONB,\n    \
             \"new_data\" JSONB,\n    \
             \"tenant_id\" TEXT,\n    \
             \"changed_by\" TEXT DEFAULT current_setting('{CURRENT_USER}', true),\n    \
             \"changed_at\" TIMESTAMPTZ NOT NULL DEFAULT now()\n)"
        ),
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $fn$\n\
             BEGIN\n    \
             IF TG_OP = 'DELETE' THEN\n        \
             INSERT INTO {audit_table} (record_id, operation, old_data, tenant_id)\n        \
             VALUES (OLD.id, TG_OP, to_jsonb(OLD), OLD.{tenant});\n        \
             RETURN OLD;\n    \
             ELSIF TG_OP = 'UPDATE' THEN\n        \
             INSERT INTO {audit_table} (record_id, operation, old_data, new_data, tenant_id)\n        \
             VALUES (NEW.id, TG_OP, to_jsonb(OLD), to_jsonb(NEW), NEW.{tenant});\n        \
             RETURN NEW;\n    \
             END IF;\n    \
             INSERT INTO {audit_table} (record_id, operation, new_data, tenant_id)\n    \
             VALUES (NEW.id, TG_OP, to_jsonb(NEW), NEW.{tenant});\n    \
             RETURN NEW;\n\
             END\n$fn$"
        ),
        format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"),
        format!(
            "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {target} \
             FOR EACH ROW EXECUTE FUNCTION {function}()"
        ),
    ])
}

/// `updated_at` / `updated_by` maintenance trigger
pub fn touch_trigger_sql(schema: &str, table: &str) -> Result<Vec<String>> {
    let target = qualified(schema, table)?;
    let function = qualified(schema, &derived_identifier(table, "_touch_fn"))?;
    let trigger = quote_ident(&derived_identifier(table, "_touch_trg"))?;

    Ok(vec![
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $fn$\n\
             BEGIN\n    \
             NEW.updated_at := now();\n    \
             NEW.updated_by := current_setting('{CURRENT_USER}', true);\n    \
             RETURN NEW;\n\
             END\n$fn$"
        ),
        format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"),
        format!(
            "CREATE TRIGGER {trigger} BEFORE UPDATE ON {target} \
             FOR EACH ROW EXECUTE FUNCTION {function}()"
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema::ColumnType;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("nome", ColumnType::new("text")).not_null(),
            Column::new("email", ColumnType::with_length("varchar", 255)),
        ]
    }

    fn spec<'a>(columns: &'a [Column], partition: Option<(PartitionMethod, &'a str)>) -> IsolatedTableSpec<'a> {
        IsolatedTableSpec {
            schema: "module_vendas",
            table: "clientes",
            tenant_column: "organization_id",
            organization_table: "public.organizations",
            columns,
            partition,
        }
    }

    #[test]
    fn test_control_columns_are_prepended() {
        let columns = columns();
        let statements = create_table_sql(&spec(&columns, None)).unwrap();
        assert_eq!(statements.len(), 1);

        let ddl = &statements[0];
        let id = ddl.find("\"id\" UUID").unwrap();
        let tenant = ddl.find("\"organization_id\" TEXT NOT NULL").unwrap();
        let nome = ddl.find("\"nome\" text NOT NULL").unwrap();
        assert!(id < tenant && tenant < nome);
        assert!(ddl.contains("REFERENCES \"public\".\"organizations\" (\"id\")"));
        assert!(ddl.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn test_partitioned_table_has_composite_key_and_default() {
        let columns = columns();
        let statements =
            create_table_sql(&spec(&columns, Some((PartitionMethod::Range, "created_at")))).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("PRIMARY KEY (\"id\", \"created_at\")"));
        assert!(statements[0].ends_with("PARTITION BY RANGE (\"created_at\")"));
        assert!(statements[1].contains("\"clientes_default\" PARTITION OF"));

        let hashed =
            create_table_sql(&spec(&columns, Some((PartitionMethod::Hash, "organization_id")))).unwrap();
        assert_eq!(hashed.len(), 1);
    }

    #[test]
    fn test_rejects_managed_and_unknown_columns() {
        let clash = vec![Column::new("created_at", ColumnType::new("text"))];
        assert!(create_table_sql(&spec(&clash, None)).is_err());

        let columns = columns();
        assert!(create_table_sql(&spec(&columns, Some((PartitionMethod::List, "missing")))).is_err());
    }

    #[test]
    fn test_rls_statements() {
        let statements = rls_sql("module_vendas", "clientes", "organization_id", "platform_service").unwrap();
        assert!(statements[0].contains("FORCE ROW LEVEL SECURITY"));
        assert_eq!(statements.len(), 1 + 2 * 5);
        assert!(statements.iter().any(|s| s.contains("clientes_service_bypass")));
    }

    #[test]
    fn test_audit_trigger_targets_sibling_table() {
        let statements = audit_sql("module_vendas", "clientes", "organization_id").unwrap();
        assert!(statements[0].contains("\"module_vendas\".\"clientes_audit\""));
        assert!(statements[1].contains("to_jsonb(OLD)"));
        assert!(statements[3].contains("AFTER INSERT OR UPDATE OR DELETE"));
    }

    #[test]
    fn test_indexes() {
        let statements = standard_indexes_sql("module_vendas", "clientes", "organization_id").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("\"clientes_organization_id_idx\""));
        assert!(statements[1].contains("(\"created_at\")"));
    }
}
