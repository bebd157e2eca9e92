//! Schema data structures
//!
//! This module defines the column and table model used both to generate
//! DDL for module tables and to describe tables found by introspection,
//! along with identifier validation and quoting.

use crate::error::{Result, TenantForgeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identifier PostgreSQL keeps without truncation
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a bare SQL identifier (schema, table, column, role)
///
/// Identifiers must start with a letter or underscore and contain only
/// ASCII letters, digits and underscores.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(TenantForgeError::InvalidInput(format!(
            "invalid identifier: {:?}",
            name
        )));
    }
    Ok(name)
}

/// Quote a validated identifier
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// Quote a `schema.table` pair
pub fn qualified(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

/// Quote a possibly schema-qualified name such as `public.organizations`
pub fn quote_path(path: &str) -> Result<String> {
    let parts = path
        .split('.')
        .map(quote_ident)
        .collect::<Result<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 2 {
        return Err(TenantForgeError::InvalidInput(format!("invalid object name: {:?}", path)));
    }
    Ok(parts.join("."))
}

/// Identifier made of `base` and `suffix`, shortening `base` so the result
/// fits in [`MAX_IDENTIFIER_LEN`] bytes
pub fn derived_identifier(base: &str, suffix: &str) -> String {
    let room = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len());
    let mut cut = base.len().min(room);
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &base[..cut], suffix)
}

/// Escape a value for use inside a single-quoted SQL literal.
///
/// Only used for DDL that cannot take bind parameters (defaults, policy
/// bodies) and never for caller-supplied data values.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Represents the type of a database column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnType {
    /// The base type (e.g., "varchar", "integer", "timestamptz")
    pub base_type: String,
    /// Optional length/precision (e.g., 255 for VARCHAR(255))
    pub length: Option<i64>,
    /// Optional scale for decimal types
    pub scale: Option<i64>,
    /// Array dimensions (e.g., Some(1) for TEXT[], Some(2) for TEXT[][])
    pub array_dimensions: Option<u32>,
}

impl ColumnType {
    /// A plain type without length or dimensions
    pub fn new(base_type: impl Into<String>) -> Self {
        Self {
            base_type: base_type.into(),
            length: None,
            scale: None,
            array_dimensions: None,
        }
    }

    /// `VARCHAR(n)` style type
    pub fn with_length(base_type: impl Into<String>, length: i64) -> Self {
        Self {
            length: Some(length),
            ..Self::new(base_type)
        }
    }

    fn validate(&self) -> Result<()> {
        let words_ok = self
            .base_type
            .split_whitespace()
            .all(|w| w.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        if self.base_type.trim().is_empty() || !words_ok {
            return Err(TenantForgeError::InvalidInput(format!(
                "invalid column type: {:?}",
                self.base_type
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_type)?;
        if let Some(len) = self.length {
            write!(f, "({}", len)?;
            if let Some(scale) = self.scale {
                write!(f, ", {}", scale)?;
            }
            write!(f, ")")?;
        }
        if let Some(dim) = self.array_dimensions {
            for _ in 0..dim {
                write!(f, "[]")?;
            }
        }
        Ok(())
    }
}

/// Represents a column in a database table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column data type
    pub column_type: ColumnType,
    /// Whether the column is nullable
    pub nullable: bool,
    /// Default value expression (if any)
    pub default_value: Option<String>,
    /// Whether this column is a primary key
    pub is_primary_key: bool,
    /// Whether this column is a foreign key
    pub is_foreign_key: bool,
    /// Referenced table (if this is a foreign key)
    pub references: Option<ForeignKeyReference>,
    /// Whether this column is unique
    pub is_unique: bool,
    /// Column comment (if any)
    pub comment: Option<String>,
}

impl Column {
    /// A nullable column with no constraints
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default_value: None,
            is_primary_key: false,
            is_foreign_key: false,
            references: None,
            is_unique: false,
            comment: None,
        }
    }

    /// Mark the column `NOT NULL`
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set a default expression
    pub fn default(mut self, expression: impl Into<String>) -> Self {
        self.default_value = Some(expression.into());
        self
    }

    /// Mark the column `UNIQUE`
    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Add a foreign key reference
    pub fn references(mut self, reference: ForeignKeyReference) -> Self {
        self.is_foreign_key = true;
        self.references = Some(reference);
        self
    }

    /// Render the column as a `CREATE TABLE` fragment
    pub fn to_ddl(&self) -> Result<String> {
        self.column_type.validate()?;
        let mut ddl = format!("{} {}", quote_ident(&self.name)?, self.column_type);

        if self.is_primary_key {
            ddl.push_str(" PRIMARY KEY");
        }
        if !self.nullable && !self.is_primary_key {
            ddl.push_str(" NOT NULL");
        }
        if self.is_unique {
            ddl.push_str(" UNIQUE");
        }
        if let Some(ref default) = self.default_value {
            ddl.push_str(&format!(" DEFAULT {}", default));
        }
        if let Some(ref fk) = self.references {
            ddl.push_str(&format!(" {}", fk.to_ddl()?));
        }
        Ok(ddl)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.column_type)?;

        if self.is_primary_key {
            write!(f, " PRIMARY KEY")?;
        }
        if self.is_foreign_key {
            write!(f, " FOREIGN KEY")?;
        }
        if self.is_unique {
            write!(f, " UNIQUE")?;
        }
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        if let Some(ref default) = self.default_value {
            write!(f, " DEFAULT {}", default)?;
        }
        if let Some(ref comment) = self.comment {
            write!(f, " -- {}", comment)?;
        }

        Ok(())
    }
}

/// Foreign key reference information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyReference {
    /// Referenced table name, optionally schema-qualified
    pub table: String,
    /// Referenced column name
    pub column: String,
    /// On delete action
    pub on_delete: Option<String>,
    /// On update action
    pub on_update: Option<String>,
}

impl ForeignKeyReference {
    /// Reference `table(column)` with no referential actions
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            on_delete: None,
            on_update: None,
        }
    }

    /// `REFERENCES ...` clause
    pub fn to_ddl(&self) -> Result<String> {
        let mut ddl = format!(
            "REFERENCES {} ({})",
            quote_path(&self.table)?,
            quote_ident(&self.column)?
        );
        for (keyword, action) in [("ON DELETE", &self.on_delete), ("ON UPDATE", &self.on_update)] {
            if let Some(action) = action {
                let upper = action.to_uppercase();
                let allowed = ["CASCADE", "RESTRICT", "NO ACTION", "SET NULL", "SET DEFAULT"];
                if !allowed.contains(&upper.as_str()) {
                    return Err(TenantForgeError::InvalidInput(format!(
                        "invalid referential action: {}",
                        action
                    )));
                }
                ddl.push_str(&format!(" {} {}", keyword, upper));
            }
        }
        Ok(ddl)
    }
}

/// Represents a database table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Table columns
    pub columns: Vec<Column>,
    /// Primary key columns (ordered)
    pub primary_keys: Vec<String>,
    /// Whether the table is a partitioned parent
    pub is_partitioned: bool,
    /// Estimated row count (if available)
    pub estimated_rows: Option<i64>,
    /// Total relation size in bytes (if available)
    pub size_bytes: Option<i64>,
}

impl Table {
    /// Create a new table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            is_partitioned: false,
            estimated_rows: None,
            size_bytes: None,
        }
    }

    /// Add a column to the table
    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Get a column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the table carries a column with this name
    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_display() {
        assert_eq!(ColumnType::with_length("varchar", 255).to_string(), "varchar(255)");
        assert_eq!(ColumnType::new("integer").to_string(), "integer");

        let mut tags = ColumnType::new("text");
        tags.array_dimensions = Some(1);
        assert_eq!(tags.to_string(), "text[]");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("clientes").is_ok());
        assert!(validate_identifier("_audit_2024").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_path() {
        assert_eq!(quote_path("public.organizations").unwrap(), "\"public\".\"organizations\"");
        assert_eq!(quote_path("organizations").unwrap(), "\"organizations\"");
        assert!(quote_path("a.b.c").is_err());
    }

    #[test]
    fn test_derived_identifier_fits() {
        assert_eq!(derived_identifier("clientes", "_audit"), "clientes_audit");
        let long = derived_identifier(&"t".repeat(80), "_p2024_01");
        assert_eq!(long.len(), MAX_IDENTIFIER_LEN);
        assert!(long.ends_with("_p2024_01"));
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_column_ddl() {
        let column = Column::new("email", ColumnType::with_length("varchar", 255))
            .not_null()
            .unique();
        assert_eq!(column.to_ddl().unwrap(), "\"email\" varchar(255) NOT NULL UNIQUE");

        let fk = Column::new("organization_id", ColumnType::new("text"))
            .not_null()
            .references(ForeignKeyReference::new("public.organizations", "id"));
        assert_eq!(
            fk.to_ddl().unwrap(),
            "\"organization_id\" text NOT NULL REFERENCES \"public\".\"organizations\" (\"id\")"
        );
    }

    #[test]
    fn test_column_type_rejects_injection() {
        let column = Column::new("x", ColumnType::new("text); DROP TABLE y; --"));
        assert!(column.to_ddl().is_err());
    }

    #[test]
    fn test_table_columns() {
        let mut table = Table::new("clientes");
        table.add_column(Column::new("nome", ColumnType::new("text")));
        assert!(table.has_column("nome"));
        assert!(!table.has_column("email"));
    }
}
