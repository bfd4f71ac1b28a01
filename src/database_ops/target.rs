//! The target catalog connection: introspection plus the handful of row operations the
//! writers need. Postgres binds each row as one JSON document and lets
//! `jsonb_populate_record` convert fields to the column types, so the writers never
//! carry per-type bind logic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::types::Json;
use sqlx::{ConnectOptions, Connection, Row as _};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Column name → value, in insertion order.
pub type Row = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as the target renders it (e.g. `character varying(128)`).
    pub data_type: String,
    pub max_length: Option<i64>,
    pub nullable: bool,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// Written when a row is created, never overwritten by an upsert.
pub const INSERT_ONLY_COLUMNS: [&str; 1] = ["date_add"];

/// Whether an upsert's update half may touch `column`.
pub fn updatable(column: &str, keys: &[String]) -> bool {
    !keys.iter().any(|k| k == column) && !INSERT_ONLY_COLUMNS.contains(&column)
}

#[async_trait]
pub trait CatalogTarget: Send + Sync {
    /// `None` when the table is not visible on this connection.
    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>>;

    /// Ids (ascending) of rows whose columns equal every filter value; `null` matches `IS NULL`.
    async fn select_ids(&self, table: &str, id_column: &str, filters: &Row) -> Result<Vec<i64>>;

    /// Plain insert; returns the value of `returning` when asked for.
    async fn insert(&self, table: &str, row: &Row, returning: Option<&str>) -> Result<Option<i64>>;

    /// Update `set` columns on rows matching `filters`; returns affected rows.
    async fn update(&self, table: &str, set: &Row, filters: &Row) -> Result<u64>;

    /// Insert-or-update keyed by `keys`. Rows whose columns are all keys are inserted
    /// at most once; `INSERT_ONLY_COLUMNS` are kept on update.
    async fn upsert(&self, table: &str, row: &Row, keys: &[String]) -> Result<()>;
}

pub async fn select_first_id(
    target: &dyn CatalogTarget,
    table: &str,
    id_column: &str,
    filters: &Row,
) -> Result<Option<i64>> {
    Ok(target
        .select_ids(table, id_column, filters)
        .await?
        .into_iter()
        .next())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list<'a>(cols: impl Iterator<Item = &'a String>) -> String {
    cols.map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

fn filter_clause(filters: &Row) -> String {
    if filters.is_empty() {
        return "TRUE".to_string();
    }
    filters
        .iter()
        .map(|(col, val)| {
            let q = quote_ident(col);
            if val.is_null() {
                format!("t.{q} IS NULL")
            } else {
                format!("t.{q} = f.{q}")
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// One connection for the whole run; dropped (and closed) when the run ends.
pub struct PgCatalog {
    conn: Mutex<PgConnection>,
}

impl PgCatalog {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, connect_timeout: Duration) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)?
            .statement_cache_capacity(0)
            .application_name("catalog_sync");
        let conn = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .context("timed out connecting to target catalog")??;
        info!("connected to target catalog");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.into_inner().close().await?;
        Ok(())
    }

    async fn update_then_insert(&self, table: &str, row: &Row, keys: &[String]) -> Result<()> {
        let filters: Row = keys
            .iter()
            .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let set: Row = row
            .iter()
            .filter(|(k, _)| updatable(k, keys))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if set.is_empty() {
            if self.select_ids(table, &keys[0], &filters).await?.is_empty() {
                self.insert(table, row, None).await?;
            }
            return Ok(());
        }
        if self.update(table, &set, &filters).await? == 0 {
            self.insert(table, row, None).await?;
        }
        Ok(())
    }
}

fn is_missing_conflict_target(e: &sqlx::Error) -> bool {
    match e {
        // 42P10 = invalid_column_reference (no unique constraint matches ON CONFLICT)
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P10"),
        _ => false,
    }
}

#[async_trait]
impl CatalogTarget for PgCatalog {
    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>> {
        let mut conn = self.conn.lock().await;
        let visible: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .persistent(false)
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
        if !visible {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"SELECT a.attname::text AS name,
                      format_type(a.atttypid, a.atttypmod) AS data_type,
                      CASE WHEN t.typname IN ('varchar', 'bpchar') AND a.atttypmod > 4
                           THEN (a.atttypmod - 4)::bigint END AS max_length,
                      NOT a.attnotnull AS nullable,
                      (a.attidentity <> ''
                        OR COALESCE(pg_get_expr(d.adbin, d.adrelid) LIKE 'nextval(%', false)) AS auto_increment
               FROM pg_attribute a
               JOIN pg_type t ON t.oid = a.atttypid
               LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
               WHERE a.attrelid = to_regclass($1)
                 AND a.attnum > 0
                 AND NOT a.attisdropped
               ORDER BY a.attnum"#,
        )
        .persistent(false)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
        let columns = rows
            .into_iter()
            .map(|r| ColumnInfo {
                name: r.get("name"),
                data_type: r.get("data_type"),
                max_length: r.get("max_length"),
                nullable: r.get("nullable"),
                auto_increment: r.get("auto_increment"),
            })
            .collect();

        let primary_key: Vec<String> = sqlx::query_scalar(
            r#"SELECT a.attname::text
               FROM pg_index i
               CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
               JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
               WHERE i.indrelid = to_regclass($1) AND i.indisprimary
               ORDER BY k.ord"#,
        )
        .persistent(false)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        debug!(table, pk = ?primary_key, "described target table");
        Ok(Some(TableInfo {
            columns,
            primary_key,
        }))
    }

    async fn select_ids(&self, table: &str, id_column: &str, filters: &Row) -> Result<Vec<i64>> {
        let t = quote_ident(table);
        let sql = format!(
            "SELECT t.{id}::bigint FROM {t} AS t, jsonb_populate_record(NULL::{t}, $1) AS f WHERE {w} ORDER BY 1",
            id = quote_ident(id_column),
            w = filter_clause(filters),
        );
        let mut conn = self.conn.lock().await;
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .persistent(false)
            .bind(Json(filters))
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids)
    }

    async fn insert(&self, table: &str, row: &Row, returning: Option<&str>) -> Result<Option<i64>> {
        let t = quote_ident(table);
        let mut sql = if row.is_empty() {
            format!("INSERT INTO {t} DEFAULT VALUES")
        } else {
            let cols = quoted_list(row.keys());
            format!("INSERT INTO {t} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{t}, $1)")
        };
        if let Some(ret) = returning {
            sql.push_str(&format!(" RETURNING {}::bigint", quote_ident(ret)));
        }
        let mut conn = self.conn.lock().await;
        let mut q = sqlx::query(&sql).persistent(false);
        if !row.is_empty() {
            q = q.bind(Json(row));
        }
        match returning {
            Some(_) => {
                let rec = q.fetch_one(&mut *conn).await?;
                Ok(Some(rec.try_get::<i64, _>(0)?))
            }
            None => {
                q.execute(&mut *conn).await?;
                Ok(None)
            }
        }
    }

    async fn update(&self, table: &str, set: &Row, filters: &Row) -> Result<u64> {
        if set.is_empty() {
            return Ok(0);
        }
        let t = quote_ident(table);
        let assignments = set
            .keys()
            .map(|c| {
                let q = quote_ident(c);
                format!("{q} = s.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {t} AS t SET {assignments} \
             FROM jsonb_populate_record(NULL::{t}, $1) AS s, jsonb_populate_record(NULL::{t}, $2) AS f \
             WHERE {w}",
            w = filter_clause(filters),
        );
        let mut conn = self.conn.lock().await;
        let done = sqlx::query(&sql)
            .persistent(false)
            .bind(Json(set))
            .bind(Json(filters))
            .execute(&mut *conn)
            .await?;
        Ok(done.rows_affected())
    }

    async fn upsert(&self, table: &str, row: &Row, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            anyhow::bail!("upsert into {table} needs at least one key column");
        }
        let t = quote_ident(table);
        let cols = quoted_list(row.keys());
        let updates = row
            .keys()
            .filter(|c| updatable(c, keys))
            .map(|c| {
                let q = quote_ident(c);
                format!("{q} = EXCLUDED.{q}")
            })
            .collect::<Vec<_>>();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {t} AS t ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{t}, $1) \
             ON CONFLICT ({k}) {action}",
            k = quoted_list(keys.iter()),
        );
        let outcome = {
            let mut conn = self.conn.lock().await;
            sqlx::query(&sql)
                .persistent(false)
                .bind(Json(row))
                .execute(&mut *conn)
                .await
        };
        match outcome {
            Ok(_) => Ok(()),
            // Declared keys without a matching unique constraint: converge by hand.
            Err(e) if is_missing_conflict_target(&e) => {
                debug!(table, ?keys, "no unique constraint on keys; update-then-insert");
                self.update_then_insert(table, row, keys).await
            }
            Err(e) => Err(e.into()),
        }
    }
}
