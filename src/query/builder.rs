//! Statement builders
//!
//! Every statement returns its rows as `row_to_json` so results can be
//! deserialized into any `DeserializeOwned` type and cached as JSON.

use super::condition::Condition;
use crate::database::schema::{qualified, quote_ident, quote_path};
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use crate::isolation::TenantContext;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use std::time::Duration;

/// One `ORDER BY` term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    /// Parse `"created_at desc"` style terms
    pub fn parse(term: &str) -> Result<Self> {
        let mut words = term.split_whitespace();
        let column = words
            .next()
            .ok_or_else(|| TenantForgeError::InvalidInput("empty order term".to_string()))?;
        let descending = match words.next().map(|w| w.to_ascii_lowercase()) {
            None => false,
            Some(dir) if dir == "asc" => false,
            Some(dir) if dir == "desc" => true,
            Some(other) => {
                return Err(TenantForgeError::InvalidInput(format!("unknown sort direction: {}", other)))
            }
        };
        if words.next().is_some() {
            return Err(TenantForgeError::InvalidInput(format!("invalid order term: {}", term)));
        }
        Ok(Self {
            column: column.to_string(),
            descending,
        })
    }

    fn to_sql(&self) -> Result<String> {
        Ok(format!(
            "{} {}",
            quote_ident(&self.column)?,
            if self.descending { "DESC" } else { "ASC" }
        ))
    }
}

/// Options accepted by every façade operation
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub where_clause: Option<Condition>,
    /// Select list; empty selects every column
    pub columns: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub group_by: Vec<String>,
    /// Applied to the grouped output columns
    pub having: Option<Condition>,
    /// Read through the cache; defaults to on
    pub cache: Option<bool>,
    pub cache_ttl: Option<Duration>,
    /// Skip the cached value and reload
    pub refresh: bool,
    pub module_name: Option<String>,
    pub tenant_id: Option<String>,
    /// Full tenant context; takes precedence over `tenant_id`
    pub tenant: Option<TenantContext>,
}

impl QueryOptions {
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module_name: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    /// Filter from a structured JSON object, see [`Condition::from_json`]
    pub fn filter_json(self, condition: &Value) -> Result<Self> {
        Ok(self.filter(Condition::from_json(condition)?))
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, condition: Condition) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = Some(false);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn tenant(mut self, context: TenantContext) -> Self {
        self.tenant = Some(context);
        self
    }

    /// Context bound for the statement, if any
    pub fn tenant_context(&self) -> Option<TenantContext> {
        self.tenant
            .clone()
            .or_else(|| self.tenant_id.as_ref().map(TenantContext::new))
    }

    pub fn uses_cache(&self) -> bool {
        self.cache.unwrap_or(true)
    }
}

/// Quote `table` inside `schema`; a dotted name is taken as already
/// schema-qualified
pub fn target_name(schema: Option<&str>, table: &str) -> Result<String> {
    match schema {
        _ if table.contains('.') => quote_path(table),
        Some(schema) => qualified(schema, table),
        None => quote_ident(table),
    }
}

fn select_item(item: &str) -> Result<String> {
    static AGGREGATE: OnceLock<Regex> = OnceLock::new();
    let aggregate = AGGREGATE.get_or_init(|| {
        Regex::new(
            r"(?i)^(count|sum|avg|min|max)\s*\(\s*(\*|[A-Za-z_][A-Za-z0-9_]*)\s*\)(?:\s+as\s+([A-Za-z_][A-Za-z0-9_]*))?$",
        )
        .expect("aggregate pattern is a valid regex")
    });

    let item = item.trim();
    let Some(caps) = aggregate.captures(item) else {
        return quote_ident(item);
    };
    let function = caps[1].to_ascii_lowercase();
    let argument = match &caps[2] {
        "*" => "*".to_string(),
        column => quote_ident(column)?,
    };
    let alias = caps.get(3).map_or(function.as_str(), |m| m.as_str());
    Ok(format!("{}({}) AS {}", function, argument, quote_ident(alias)?))
}

/// `SELECT` producing one JSON object per row
pub fn select_sql(target: &str, options: &QueryOptions) -> Result<(String, Vec<SqlValue>)> {
    let mut params = Vec::new();

    let columns = if options.columns.is_empty() {
        "*".to_string()
    } else {
        options
            .columns
            .iter()
            .map(|c| select_item(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };
    let mut sql = format!("SELECT {} FROM {}", columns, target);

    if let Some(condition) = options.where_clause.as_ref().filter(|c| !c.is_empty()) {
        sql.push_str(&format!(" WHERE {}", condition.to_sql(&mut params)?));
    }
    if !options.group_by.is_empty() {
        let groups = options
            .group_by
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }
    if let Some(having) = options.having.as_ref().filter(|c| !c.is_empty()) {
        if options.group_by.is_empty() {
            return Err(TenantForgeError::InvalidInput("having requires group_by".to_string()));
        }
        sql = format!("SELECT * FROM ({}) g WHERE {}", sql, having.to_sql(&mut params)?);
    }
    if !options.order_by.is_empty() {
        let terms = options
            .order_by
            .iter()
            .map(OrderBy::to_sql)
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
    }
    if let Some(limit) = options.limit {
        params.push(SqlValue::Int(to_i64(limit)?));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
    }
    if let Some(offset) = options.offset {
        params.push(SqlValue::Int(to_i64(offset)?));
        sql.push_str(&format!(" OFFSET ${}", params.len()));
    }

    Ok((format!("SELECT row_to_json(r) FROM ({}) r", sql), params))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| TenantForgeError::InvalidInput(format!("{} is out of range", value)))
}

fn column_list(row: &Map<String, Value>) -> Result<String> {
    Ok(row
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn as_object<'a>(row: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    row.as_object()
        .ok_or_else(|| TenantForgeError::InvalidInput(format!("{} must be a JSON object", what)))
}

/// `INSERT` of one row; values are typed by the table through
/// `jsonb_populate_record`
pub fn insert_sql(target: &str, row: &Value) -> Result<(String, Vec<SqlValue>)> {
    let row = as_object(row, "inserted row")?;
    if row.is_empty() {
        return Ok((
            format!("INSERT INTO {} AS r DEFAULT VALUES RETURNING row_to_json(r)", target),
            Vec::new(),
        ));
    }
    let columns = column_list(row)?;
    Ok((
        format!(
            "INSERT INTO {0} AS r ({1}) SELECT {1} FROM jsonb_populate_record(NULL::{0}, $1) RETURNING row_to_json(r)",
            target, columns
        ),
        vec![SqlValue::Json(Value::Object(row.clone()))],
    ))
}

/// `UPDATE` of the rows matching `condition`, which must restrict something
pub fn update_sql(target: &str, changes: &Value, condition: Option<&Condition>) -> Result<(String, Vec<SqlValue>)> {
    let changes = as_object(changes, "update")?;
    if changes.is_empty() {
        return Err(TenantForgeError::InvalidInput("update has no columns".to_string()));
    }
    let condition = required_condition(condition, "UPDATE")?;

    let columns = column_list(changes)?;
    let mut params = vec![SqlValue::Json(Value::Object(changes.clone()))];
    let predicate = condition.to_sql(&mut params)?;
    Ok((
        format!(
            "UPDATE {0} AS r SET ({1}) = (SELECT {1} FROM jsonb_populate_record(NULL::{0}, $1)) WHERE {2} RETURNING row_to_json(r)",
            target, columns, predicate
        ),
        params,
    ))
}

/// `DELETE` of the rows matching `condition`, which must restrict something
pub fn delete_sql(target: &str, condition: Option<&Condition>) -> Result<(String, Vec<SqlValue>)> {
    let condition = required_condition(condition, "DELETE")?;
    let mut params = Vec::new();
    let predicate = condition.to_sql(&mut params)?;
    Ok((format!("DELETE FROM {} AS r WHERE {}", target, predicate), params))
}

fn required_condition<'a>(condition: Option<&'a Condition>, verb: &str) -> Result<&'a Condition> {
    condition.filter(|c| !c.is_empty()).ok_or_else(|| {
        TenantForgeError::InvalidInput(format!("{} requires a where condition", verb))
    })
}

/// Wrap a caller's `SELECT` so its rows come back as JSON
pub fn raw_select_sql(sql: &str) -> Result<String> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    if body.is_empty() || body.contains(';') {
        return Err(TenantForgeError::InvalidInput(
            "raw queries take exactly one statement".to_string(),
        ));
    }
    Ok(format!("SELECT row_to_json(r) FROM ({}) r", body))
}

/// Cache key of a read: `<module>:query:<sha256>` over the statement,
/// its parameters and the tenant
pub fn cache_key(module: &str, sql: &str, params: &[SqlValue], tenant: Option<&TenantContext>) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(params)?);
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(&tenant)?);
    Ok(format!("{}:query:{}", module, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::Operator;
    use serde_json::json;

    #[test]
    fn test_select_with_everything() {
        let options = QueryOptions::default()
            .columns(["region", "count(*) as total"])
            .filter(Condition::eq("status", "open"))
            .group_by(["region"])
            .having(Condition::field("total", Operator::Gt, 5))
            .order_by(OrderBy::desc("total"))
            .limit(10)
            .offset(20);
        let (sql, params) = select_sql("\"module_vendas\".\"pedidos\"", &options).unwrap();

        assert_eq!(
            sql,
            "SELECT row_to_json(r) FROM (SELECT * FROM (SELECT \"region\", count(*) AS \"total\" \
             FROM \"module_vendas\".\"pedidos\" WHERE \"status\"::text = $1 GROUP BY \"region\") g \
             WHERE \"total\" > $2 ORDER BY \"total\" DESC LIMIT $3 OFFSET $4) r"
        );
        assert_eq!(
            params,
            vec![SqlValue::from("open"), SqlValue::Int(5), SqlValue::Int(10), SqlValue::Int(20)]
        );
    }

    #[test]
    fn test_negated_empty_filter_keeps_where_clause() {
        let options = QueryOptions::default().filter_json(&json!({"$not": {}})).unwrap();
        let (sql, params) = select_sql("\"pedidos\"", &options).unwrap();
        assert!(sql.contains(" WHERE NOT (TRUE)"), "{}", sql);
        assert!(params.is_empty());

        let grouped = QueryOptions::default()
            .columns(["region"])
            .group_by(["region"])
            .having(Condition::not(Condition::and(vec![])));
        let (sql, _) = select_sql("\"pedidos\"", &grouped).unwrap();
        assert!(sql.contains(") g WHERE NOT (TRUE)"), "{}", sql);

        let (sql, _) = delete_sql("\"pedidos\"", Some(&Condition::not(Condition::and(vec![])))).unwrap();
        assert!(sql.contains("WHERE NOT (TRUE)"), "{}", sql);
    }

    #[test]
    fn test_plain_select() {
        let (sql, params) = select_sql("\"pedidos\"", &QueryOptions::default()).unwrap();
        assert_eq!(sql, "SELECT row_to_json(r) FROM (SELECT * FROM \"pedidos\") r");
        assert!(params.is_empty());
    }

    #[test]
    fn test_select_rejects_unsafe_columns() {
        let options = QueryOptions::default().columns(["id; DROP TABLE x"]);
        assert!(select_sql("\"pedidos\"", &options).is_err());

        let options = QueryOptions::default().having(Condition::eq("total", 1));
        assert!(select_sql("\"pedidos\"", &options).is_err());
    }

    #[test]
    fn test_insert_binds_one_json_parameter() {
        let (sql, params) = insert_sql("\"s\".\"t\"", &json!({"nome": "Ana", "total": 10})).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"s\".\"t\" AS r (\"nome\", \"total\") SELECT \"nome\", \"total\" \
             FROM jsonb_populate_record(NULL::\"s\".\"t\", $1) RETURNING row_to_json(r)"
        );
        assert_eq!(params, vec![SqlValue::Json(json!({"nome": "Ana", "total": 10}))]);
        assert!(insert_sql("\"s\".\"t\"", &json!([1])).is_err());
    }

    #[test]
    fn test_update_and_delete_require_condition() {
        let changes = json!({"status": "closed"});
        assert!(update_sql("\"t\"", &changes, None).is_err());
        assert!(update_sql("\"t\"", &changes, Some(&Condition::and(vec![]))).is_err());
        assert!(delete_sql("\"t\"", None).is_err());

        let condition = Condition::eq("id", "abc");
        let (sql, params) = update_sql("\"t\"", &changes, Some(&condition)).unwrap();
        assert!(sql.ends_with("WHERE \"id\"::text = $2 RETURNING row_to_json(r)"));
        assert_eq!(params.len(), 2);

        let (sql, params) = delete_sql("\"t\"", Some(&condition)).unwrap();
        assert_eq!(sql, "DELETE FROM \"t\" AS r WHERE \"id\"::text = $1");
        assert_eq!(params, vec![SqlValue::from("abc")]);
    }

    #[test]
    fn test_raw_select_wrapping() {
        assert_eq!(
            raw_select_sql("SELECT 1 AS one;").unwrap(),
            "SELECT row_to_json(r) FROM (SELECT 1 AS one) r"
        );
        assert!(raw_select_sql("SELECT 1; DROP TABLE x").is_err());
        assert!(raw_select_sql("  ").is_err());
    }

    #[test]
    fn test_target_names() {
        assert_eq!(target_name(Some("module_vendas"), "pedidos").unwrap(), "\"module_vendas\".\"pedidos\"");
        assert_eq!(target_name(Some("module_vendas"), "public.orgs").unwrap(), "\"public\".\"orgs\"");
        assert_eq!(target_name(None, "pedidos").unwrap(), "\"pedidos\"");
        assert!(target_name(None, "a.b.c").is_err());
    }

    #[test]
    fn test_cache_key_separates_tenants() {
        let params = vec![SqlValue::from("open")];
        let a = cache_key("vendas", "SELECT 1", &params, Some(&TenantContext::new("org-a"))).unwrap();
        let b = cache_key("vendas", "SELECT 1", &params, Some(&TenantContext::new("org-b"))).unwrap();
        let again = cache_key("vendas", "SELECT 1", &params, Some(&TenantContext::new("org-a"))).unwrap();

        assert!(a.starts_with("vendas:query:"));
        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_ne!(a, cache_key("vendas", "SELECT 1", &[], None).unwrap());
    }

    #[test]
    fn test_order_term_parsing() {
        assert_eq!(OrderBy::parse("created_at DESC").unwrap(), OrderBy::desc("created_at"));
        assert_eq!(OrderBy::parse("nome").unwrap(), OrderBy::asc("nome"));
        assert!(OrderBy::parse("nome sideways").is_err());
    }
}
