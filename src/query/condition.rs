//! Structured query conditions
//!
//! A [`Condition`] renders to a SQL predicate with `$n` placeholders; every
//! value is pushed onto the parameter list and never written into the SQL
//! text.

use crate::database::schema::quote_ident;
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    ILike,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Whether the operator takes no value
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', " ");
        match normalized.trim_start_matches('$') {
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "<>" | "≠" | "ne" => Ok(Operator::Ne),
            ">" | "gt" => Ok(Operator::Gt),
            ">=" | "≥" | "gte" => Ok(Operator::Gte),
            "<" | "lt" => Ok(Operator::Lt),
            "<=" | "≤" | "lte" => Ok(Operator::Lte),
            "in" => Ok(Operator::In),
            "not in" | "nin" => Ok(Operator::NotIn),
            "like" => Ok(Operator::Like),
            "ilike" => Ok(Operator::ILike),
            "is null" => Ok(Operator::IsNull),
            "is not null" => Ok(Operator::IsNotNull),
            _ => Err(TenantForgeError::InvalidInput(format!("unknown operator: {}", s))),
        }
    }
}

/// A predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Field {
        column: String,
        op: Operator,
        value: SqlValue,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// `column = value`; a `Null` value becomes `IS NULL`
    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        let value = value.into();
        let op = if value == SqlValue::Null {
            Operator::IsNull
        } else {
            Operator::Eq
        };
        Condition::Field {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn field(column: impl Into<String>, op: Operator, value: impl Into<SqlValue>) -> Self {
        Condition::Field {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::field(column, Operator::IsNull, SqlValue::Null)
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// True when the condition restricts nothing (an empty `AND`).
    /// A negation always restricts: `NOT (TRUE)` matches no row.
    pub fn is_empty(&self) -> bool {
        match self {
            Condition::And(items) => items.iter().all(Condition::is_empty),
            _ => false,
        }
    }

    /// Build a condition from a JSON object.
    ///
    /// `{"col": v}` is equality, `{"col": {">=": v}}` applies operators and
    /// `$and`, `$or`, `$not` combine. Sibling keys are joined with `AND`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TenantForgeError::InvalidInput("condition must be a JSON object".to_string()))?;

        let mut parts = Vec::with_capacity(object.len());
        for (key, value) in object {
            match key.as_str() {
                "$and" | "$or" => {
                    let items = value
                        .as_array()
                        .ok_or_else(|| TenantForgeError::InvalidInput(format!("{} takes an array", key)))?
                        .iter()
                        .map(Condition::from_json)
                        .collect::<Result<Vec<_>>>()?;
                    parts.push(if key == "$and" {
                        Condition::And(items)
                    } else {
                        Condition::Or(items)
                    });
                }
                "$not" => parts.push(Condition::not(Condition::from_json(value)?)),
                column => parts.extend(field_from_json(column, value)?),
            }
        }

        Ok(match parts.len() {
            1 => parts.remove(0),
            _ => Condition::And(parts),
        })
    }

    /// Render to SQL, appending values to `params`
    pub fn to_sql(&self, params: &mut Vec<SqlValue>) -> Result<String> {
        match self {
            Condition::Field { column, op, value } => field_sql(column, *op, value, params),
            Condition::And(items) => join_sql(items, " AND ", "TRUE", params),
            Condition::Or(items) => join_sql(items, " OR ", "FALSE", params),
            Condition::Not(inner) => Ok(format!("NOT ({})", inner.to_sql(params)?)),
        }
    }
}

fn field_from_json(column: &str, value: &Value) -> Result<Vec<Condition>> {
    match value {
        Value::Object(ops) if !ops.is_empty() => ops
            .iter()
            .map(|(op, operand)| {
                let op: Operator = op.parse()?;
                let value = if op.is_unary() {
                    SqlValue::Null
                } else {
                    SqlValue::from_json(operand)
                };
                Ok(Condition::field(column, op, value))
            })
            .collect(),
        other => Ok(vec![Condition::eq(column, SqlValue::from_json(other))]),
    }
}

fn join_sql(items: &[Condition], separator: &str, empty: &str, params: &mut Vec<SqlValue>) -> Result<String> {
    if items.is_empty() {
        return Ok(empty.to_string());
    }
    let rendered = items
        .iter()
        .map(|c| c.to_sql(params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", rendered.join(separator)))
}

fn placeholder(value: SqlValue, params: &mut Vec<SqlValue>) -> String {
    let hint = value.cast_hint();
    params.push(value);
    format!("${}{}", params.len(), hint)
}

fn field_sql(column: &str, op: Operator, value: &SqlValue, params: &mut Vec<SqlValue>) -> Result<String> {
    let column = quote_ident(column)?;

    match op {
        Operator::IsNull | Operator::IsNotNull => Ok(format!("{} {}", column, op)),
        Operator::In | Operator::NotIn => {
            let items = match value {
                SqlValue::TextArray(items) => items.clone(),
                SqlValue::Null => Vec::new(),
                other => {
                    return Err(TenantForgeError::InvalidInput(format!(
                        "{} on {} needs a list, got {:?}",
                        op, column, other
                    )))
                }
            };
            if items.is_empty() {
                return Ok(if op == Operator::In { "FALSE" } else { "TRUE" }.to_string());
            }
            let slot = placeholder(SqlValue::TextArray(items), params);
            Ok(if op == Operator::In {
                format!("{}::text = ANY({})", column, slot)
            } else {
                format!("NOT ({}::text = ANY({}))", column, slot)
            })
        }
        Operator::Eq | Operator::Ne if *value == SqlValue::Null => Err(TenantForgeError::InvalidInput(format!(
            "compare {} with null using IS NULL",
            column
        ))),
        // text values compare against the column's text form so uuid and
        // enum columns match string input
        Operator::Eq | Operator::Ne | Operator::Like | Operator::ILike if matches!(value, SqlValue::Text(_)) => {
            Ok(format!("{}::text {} {}", column, op, placeholder(value.clone(), params)))
        }
        _ => Ok(format!("{} {} {}", column, op, placeholder(value.clone(), params))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(condition: &Condition) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let sql = condition.to_sql(&mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_builder_renders_placeholders() {
        let condition = Condition::and(vec![
            Condition::eq("status", "open"),
            Condition::field("total", Operator::Gte, 100),
            Condition::not(Condition::is_null("closed_at")),
        ]);
        let (sql, params) = render(&condition);

        assert_eq!(
            sql,
            "(\"status\"::text = $1 AND \"total\" >= $2 AND NOT (\"closed_at\" IS NULL))"
        );
        assert_eq!(params, vec![SqlValue::from("open"), SqlValue::Int(100)]);
    }

    #[test]
    fn test_values_never_reach_sql_text() {
        let condition = Condition::eq("name", "x'; DROP TABLE pedidos; --");
        let (sql, params) = render(&condition);
        assert!(!sql.contains("DROP"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_from_json_objects() {
        let condition = Condition::from_json(&json!({
            "status": "open",
            "total": {">=": 10, "<": 50},
            "$or": [{"region": {"in": ["sul", "norte"]}}, {"priority": {"is_null": true}}]
        }))
        .unwrap();
        let (sql, params) = render(&condition);

        assert!(sql.contains("\"total\" >= $"));
        assert!(sql.contains("\"total\" < $"));
        assert!(sql.contains("(\"region\"::text = ANY($"));
        assert!(sql.contains("::text[]) OR \"priority\" IS NULL)"));
        assert_eq!(params.len(), 4);
        assert!(params.contains(&SqlValue::TextArray(vec!["sul".to_string(), "norte".to_string()])));
    }

    #[test]
    fn test_from_json_not_and_null() {
        let condition = Condition::from_json(&json!({"$not": {"deleted_at": null}})).unwrap();
        let (sql, params) = render(&condition);
        assert_eq!(sql, "NOT (\"deleted_at\" IS NULL)");
        assert!(params.is_empty());
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(Condition::from_json(&json!(["status"])).is_err());
        assert!(Condition::from_json(&json!({"total": {"~": 1}})).is_err());
        assert!(Condition::from_json(&json!({"$and": {"a": 1}})).is_err());

        let mut params = Vec::new();
        assert!(Condition::eq("bad column", 1).to_sql(&mut params).is_err());
        assert!(Condition::field("id", Operator::In, 5).to_sql(&mut params).is_err());
    }

    #[test]
    fn test_empty_lists_and_groups() {
        let (sql, params) = render(&Condition::field("id", Operator::In, SqlValue::TextArray(vec![])));
        assert_eq!(sql, "FALSE");
        assert!(params.is_empty());

        assert!(Condition::and(vec![]).is_empty());
        assert_eq!(render(&Condition::or(vec![])).0, "FALSE");
    }

    #[test]
    fn test_negated_empty_group_still_restricts() {
        let condition = Condition::from_json(&json!({"$not": {}})).unwrap();
        assert!(!condition.is_empty());
        assert!(render(&condition).0.contains("NOT (TRUE)"));
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("≥".parse::<Operator>().unwrap(), Operator::Gte);
        assert_eq!("NOT IN".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("$ne".parse::<Operator>().unwrap(), Operator::Ne);
        assert_eq!("is_not_null".parse::<Operator>().unwrap(), Operator::IsNotNull);
    }
}
