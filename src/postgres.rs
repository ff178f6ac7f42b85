//! PostgreSQL connections backed by sqlx
//!
//! The store works with blocking connections, so [`PgConnectionPool`] owns a
//! current-thread tokio runtime and drives every sqlx future with
//! `Runtime::block_on`. Do not use it from inside another async runtime.

use std::sync::Arc;

use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use tokio::runtime::Runtime;

use crate::connection::{Connection, ConnectionPool};
use crate::error::{FeatureStoreError, Result};
use crate::feature::Row;
use crate::sql::{escape_literal, quote_qualified};
use crate::types::{ColumnInfo, ColumnType};

/// Pool of blocking PostgreSQL connections
pub struct PgConnectionPool {
    runtime: Arc<Runtime>,
    pool: PgPool,
    like_escape: String,
}

impl PgConnectionPool {
    /// Connect with `\` as the LIKE escape used by introspection
    pub fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_escape(database_url, "\\")
    }

    /// Connect; `like_escape` must match the escape string names are escaped with
    pub fn connect_with_escape(database_url: &str, like_escape: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FeatureStoreError::connection(format!("Failed to start runtime: {}", e)))?;

        let pool = runtime.block_on(PgPool::connect(database_url)).map_err(|e| {
            FeatureStoreError::Connection(format!("Database connection failed: {}", e))
        })?;

        Ok(Self {
            runtime: Arc::new(runtime),
            pool,
            like_escape: like_escape.to_string(),
        })
    }
}

impl ConnectionPool for PgConnectionPool {
    fn acquire(&self) -> Result<Box<dyn Connection>> {
        let inner = self
            .runtime
            .block_on(self.pool.acquire())
            .map_err(|e| FeatureStoreError::connection(format!("Failed to acquire connection: {}", e)))?;
        Ok(Box::new(PgConnection {
            runtime: Arc::clone(&self.runtime),
            inner: Some(inner),
            auto_commit: true,
            in_transaction: false,
            like_escape: self.like_escape.clone(),
        }))
    }

    fn release(&self, mut connection: Box<dyn Connection>) -> Result<()> {
        connection.close()
    }
}

/// A pooled PostgreSQL connection driven synchronously
pub struct PgConnection {
    runtime: Arc<Runtime>,
    inner: Option<PoolConnection<Postgres>>,
    auto_commit: bool,
    in_transaction: bool,
    like_escape: String,
}

impl PgConnection {
    fn run(&mut self, sql: &str) -> Result<u64> {
        let runtime = &self.runtime;
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| FeatureStoreError::connection("Connection is closed"))?;
        let done = runtime.block_on(sqlx::query(sql).execute(&mut **inner))?;
        Ok(done.rows_affected())
    }

    fn fetch(&mut self, sql: &str, binds: &[&str]) -> Result<Vec<PgRow>> {
        let runtime = &self.runtime;
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| FeatureStoreError::connection("Connection is closed"))?;
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        Ok(runtime.block_on(query.fetch_all(&mut **inner))?)
    }

    fn like(&self, column: &str, placeholder: &str) -> String {
        format!(
            "{} LIKE {} ESCAPE '{}'",
            column,
            placeholder,
            escape_literal(&self.like_escape, false, false)
        )
    }

    /// Columns joined with their constraint, filtered by schema/table patterns
    fn constraint_columns(
        &mut self,
        constraint_type: &str,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let (schema_clause, binds) = match schema {
            Some(schema) => (self.like("tc.table_schema", "$2"), vec![table, schema]),
            None => ("tc.table_schema = current_schema()".to_string(), vec![table]),
        };
        let sql = format!(
            "SELECT tc.constraint_name::text AS constraint_name, \
                    kcu.column_name::text AS column_name, \
                    c.data_type::text AS data_type, \
                    c.is_identity::text AS is_identity \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
              AND tc.table_name = kcu.table_name \
             JOIN information_schema.columns c \
               ON c.table_schema = kcu.table_schema \
              AND c.table_name = kcu.table_name \
              AND c.column_name = kcu.column_name \
             WHERE tc.constraint_type = '{}' AND {} AND {} \
             ORDER BY tc.constraint_name, kcu.ordinal_position",
            constraint_type,
            self.like("tc.table_name", "$1"),
            schema_clause
        );

        first_group(&self.fetch(&sql, &binds)?)
    }

    /// Columns of unique indexes, constraint-backed or created with
    /// `CREATE UNIQUE INDEX`; primary, partial and expression indexes are skipped
    fn unique_indexes(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let (schema_clause, binds) = match schema {
            Some(schema) => (self.like("n.nspname", "$2"), vec![table, schema]),
            None => ("n.nspname = current_schema()".to_string(), vec![table]),
        };
        let sql = format!(
            "SELECT i.relname::text AS constraint_name, \
                    a.attname::text AS column_name, \
                    c.data_type::text AS data_type, \
                    c.is_identity::text AS is_identity \
             FROM pg_index x \
             JOIN pg_class t ON t.oid = x.indrelid \
             JOIN pg_class i ON i.oid = x.indexrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             JOIN information_schema.columns c \
               ON c.table_schema = n.nspname \
              AND c.table_name = t.relname \
              AND c.column_name = a.attname \
             WHERE x.indisunique AND NOT x.indisprimary \
               AND x.indexprs IS NULL AND x.indpred IS NULL \
               AND {} AND {} \
             ORDER BY i.relname, k.ord",
            self.like("t.relname", "$1"),
            schema_clause
        );

        first_group(&self.fetch(&sql, &binds)?)
    }
}

/// Columns of the first constraint or index in rows ordered by its name
fn first_group(rows: &[PgRow]) -> Result<Vec<ColumnInfo>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let constraint: String = first.try_get("constraint_name")?;

    rows.iter()
        .filter(|row| {
            row.try_get::<String, _>("constraint_name")
                .is_ok_and(|name| name == constraint)
        })
        .map(column_info)
        .collect()
}

fn column_info(row: &PgRow) -> Result<ColumnInfo> {
    let name: String = row.try_get("column_name")?;
    let data_type: String = row.try_get("data_type")?;
    let is_identity: Option<String> = row.try_get("is_identity")?;

    let column = ColumnInfo::new(name, ColumnType::from_sql_type(&data_type));
    Ok(if is_identity.as_deref() == Some("YES") {
        column.auto_increment()
    } else {
        column
    })
}

/// Decode one column of a row into JSON by its PostgreSQL type name
fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(index)?),
        "INT2" => Value::from(row.try_get::<i16, _>(index)?),
        "INT4" => Value::from(row.try_get::<i32, _>(index)?),
        "INT8" => Value::from(row.try_get::<i64, _>(index)?),
        "FLOAT4" => float(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => float(row.try_get::<f64, _>(index)?),
        "NUMERIC" => {
            use rust_decimal::prelude::ToPrimitive;
            let decimal = row.try_get::<rust_decimal::Decimal, _>(index)?;
            decimal.to_f64().map(float).unwrap_or(Value::Null)
        }
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => Value::String(row.try_get::<chrono::NaiveDateTime, _>(index)?.to_string()),
        "DATE" => Value::String(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index)?,
        other => Value::String(row.try_get::<String, _>(index).map_err(|e| {
            FeatureStoreError::data_access_from(
                format!("decoding column of type {}; cast it to text", other),
                e,
            )
        })?),
    };
    Ok(value)
}

fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl Connection for PgConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        if auto_commit && self.in_transaction {
            self.run("COMMIT")?;
            self.in_transaction = false;
        } else if !auto_commit && !self.in_transaction {
            self.run("BEGIN")?;
            self.in_transaction = true;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.run("COMMIT")?;
            self.in_transaction = false;
        }
        if !self.auto_commit {
            self.run("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.run("ROLLBACK")?;
            self.in_transaction = false;
        }
        if !self.auto_commit {
            self.run("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let result = if self.in_transaction {
            self.in_transaction = false;
            self.run("ROLLBACK").map(|_| ())
        } else {
            Ok(())
        };
        self.auto_commit = true;

        if let Some(inner) = self.inner.take() {
            // returning a connection to the pool spawns onto the runtime
            let _guard = self.runtime.enter();
            drop(inner);
        }
        result
    }

    fn execute(&mut self, sql: &str) -> Result<u64> {
        self.run(sql)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let rows = self.fetch(sql, &[])?;
        rows.iter()
            .map(|row| {
                let mut out = Row::new();
                for (index, column) in row.columns().iter().enumerate() {
                    let value = decode_value(row, index, column.type_info().name())?;
                    out.insert(column.name().to_string(), value);
                }
                Ok(out)
            })
            .collect()
    }

    fn columns(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let (schema_clause, binds) = match schema {
            Some(schema) => (self.like("table_schema", "$2"), vec![table, schema]),
            None => ("table_schema = current_schema()".to_string(), vec![table]),
        };
        let sql = format!(
            "SELECT column_name::text AS column_name, data_type::text AS data_type, \
                    is_identity::text AS is_identity \
             FROM information_schema.columns \
             WHERE {} AND {} \
             ORDER BY ordinal_position",
            self.like("table_name", "$1"),
            schema_clause
        );
        self.fetch(&sql, &binds)?.iter().map(column_info).collect()
    }

    fn primary_key_columns(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        self.constraint_columns("PRIMARY KEY", schema, table)
    }

    fn unique_index_columns(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        self.unique_indexes(schema, table)
    }

    fn sequence_for_column(
        &mut self,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<String>> {
        let qualified = quote_qualified(schema, table);
        let rows = self.fetch(
            "SELECT pg_get_serial_sequence($1, $2)::text AS sequence",
            &[qualified.as_str(), column],
        )?;
        match rows.first() {
            Some(row) => Ok(row.try_get::<Option<String>, _>("sequence")?),
            None => Ok(None),
        }
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _guard = self.runtime.enter();
            drop(inner);
        }
    }
}
