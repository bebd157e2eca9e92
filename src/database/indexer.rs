//! Schema Indexer
//!
//! Introspects a module schema through the PostgreSQL system catalogs and
//! builds [`Table`] descriptions. Backups use it to enumerate tables and to
//! find tables carrying an `updated_at` column; the console uses it to show
//! what a module owns.

use crate::database::schema::{Column, ColumnType, Table};
use crate::error::Result;
use sqlx::{postgres::PgPool, Row};

/// Tables (and partitioned parents) owned by `schema`, without their columns.
/// Individual partitions are not listed.
pub async fn list_tables(pool: &PgPool, schema: &str) -> Result<Vec<Table>> {
    let tables_query = r#"
        SELECT
            c.relname::text AS table_name,
            c.relkind = 'p' AS is_partitioned,
            c.reltuples::bigint AS estimated_rows,
            pg_total_relation_size(c.oid) AS size_bytes
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
            AND c.relkind IN ('r', 'p')
            AND NOT c.relispartition
        ORDER BY c.relname
    "#;

    let rows = sqlx::query(tables_query).bind(schema).fetch_all(pool).await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let mut table = Table::new(row.try_get::<String, _>("table_name")?);
        table.is_partitioned = row.try_get("is_partitioned")?;
        table.estimated_rows = row.try_get("estimated_rows")?;
        table.size_bytes = row.try_get("size_bytes")?;
        tables.push(table);
    }
    Ok(tables)
}

/// Full description of every table in `schema`, columns and primary keys included
pub async fn index_schema(pool: &PgPool, schema: &str) -> Result<Vec<Table>> {
    let mut tables = list_tables(pool, schema).await?;
    for table in tables.iter_mut() {
        load_columns(pool, schema, table).await?;
        load_primary_key(pool, schema, table).await?;
    }
    Ok(tables)
}

/// Names of tables in `schema` that have a column called `column`
pub async fn tables_with_column(pool: &PgPool, schema: &str, column: &str) -> Result<Vec<String>> {
    let query = r#"
        SELECT c.table_name::text AS table_name
        FROM information_schema.columns c
        JOIN pg_class k ON k.relname = c.table_name
        JOIN pg_namespace n ON n.oid = k.relnamespace AND n.nspname = c.table_schema
        WHERE c.table_schema = $1
            AND c.column_name = $2
            AND k.relkind IN ('r', 'p')
            AND NOT k.relispartition
        ORDER BY c.table_name
    "#;

    let rows = sqlx::query(query)
        .bind(schema)
        .bind(column)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("table_name").map_err(Into::into))
        .collect()
}

/// Whether `schema` exists
pub async fn schema_exists(pool: &PgPool, schema: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
            .bind(schema)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

async fn load_columns(pool: &PgPool, schema: &str, table: &mut Table) -> Result<()> {
    let columns_query = r#"
        SELECT
            column_name::text AS column_name,
            data_type::text AS data_type,
            character_maximum_length::bigint AS max_len,
            numeric_precision::bigint AS precision,
            numeric_scale::bigint AS scale,
            is_nullable::text AS is_nullable,
            column_default::text AS column_default
        FROM information_schema.columns
        WHERE table_schema = $1
            AND table_name = $2
        ORDER BY ordinal_position
    "#;

    let rows = sqlx::query(columns_query)
        .bind(schema)
        .bind(&table.name)
        .fetch_all(pool)
        .await?;

    for row in rows {
        let data_type: String = row.try_get("data_type")?;
        let max_len: Option<i64> = row.try_get("max_len")?;
        let precision: Option<i64> = row.try_get("precision")?;
        let is_nullable: String = row.try_get("is_nullable")?;

        let column_type = ColumnType {
            array_dimensions: (data_type == "ARRAY").then_some(1),
            base_type: data_type,
            length: max_len.or(precision),
            scale: row.try_get("scale")?,
        };

        let mut column = Column::new(row.try_get::<String, _>("column_name")?, column_type);
        column.nullable = is_nullable == "YES";
        column.default_value = row.try_get("column_default")?;
        table.add_column(column);
    }
    Ok(())
}

async fn load_primary_key(pool: &PgPool, schema: &str, table: &mut Table) -> Result<()> {
    let pk_query = r#"
        SELECT a.attname::text AS column_name
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
        WHERE i.indrelid = format('%I.%I', $1::text, $2::text)::regclass AND i.indisprimary
        ORDER BY a.attnum
    "#;

    let rows = sqlx::query(pk_query)
        .bind(schema)
        .bind(&table.name)
        .fetch_all(pool)
        .await?;

    for row in rows {
        let pk_column: String = row.try_get("column_name")?;
        if let Some(col) = table.columns.iter_mut().find(|c| c.name == pk_column) {
            col.is_primary_key = true;
        }
        table.primary_keys.push(pk_column);
    }
    Ok(())
}
