//! PostgreSQL implementation of the destination store.
//!
//! Batches go through `COPY ... FROM STDIN WITH (FORMAT csv)`, one statement
//! per batch, so each batch commits on its own. Identifiers come from a
//! validated layout registry and are always double-quoted.

use async_trait::async_trait;
use receita_core::error::StoreError;
use receita_core::layout::{IndexSpec, Layout};
use receita_core::loader::TableStore;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::PgPool;
use tracing::{debug, info};

/// SQLSTATE codes, outside class 08, that indicate a condition worth
/// retrying on a fresh connection.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "53300", // too_many_connections
];

/// Bulk loader over a connection pool.
///
/// # Examples
///
/// ```no_run
/// use receita_core::config::DbConfig;
/// use receita_db::{connect, PgTableStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (pool, schema) = connect("postgresql://localhost/dados?schema=cnpj", &DbConfig::default()).await?;
/// let store = PgTableStore::new(pool, schema);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgTableStore {
    pool: PgPool,
    schema: Option<String>,
}

impl PgTableStore {
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        Self { pool, schema }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn recreate_table(&self, layout: &Layout) -> Result<(), StoreError> {
        let schema = self.schema.as_deref();
        let mut tx = self.pool.begin().await.map_err(classify)?;

        if let Some(name) = schema {
            sqlx::query(&create_schema_sql(name))
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        sqlx::query(&drop_table_sql(schema, &layout.table))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(&create_table_sql(schema, layout))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        info!("Table {} recreated", qualified(schema, &layout.table));
        Ok(())
    }

    async fn copy_batch(&self, layout: &Layout, payload: &[u8]) -> Result<u64, StoreError> {
        let statement = copy_sql(self.schema.as_deref(), layout);
        let mut copy = self.pool.copy_in_raw(&statement).await.map_err(classify)?;

        let sent = copy.send(payload).await.map(|_| ());
        if let Err(e) = sent {
            // The connection may already be gone; the send error is what matters.
            let _ = copy.abort(e.to_string()).await;
            return Err(classify(e));
        }
        let rows = copy.finish().await.map_err(classify)?;

        debug!("COPY into {}: {} rows", layout.table, rows);
        Ok(rows)
    }

    async fn create_indexes(&self, indexes: &[IndexSpec]) -> Result<(), StoreError> {
        for index in indexes {
            sqlx::query(&create_index_sql(self.schema.as_deref(), index))
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}

/// Separates failures worth one retry from those that will repeat.
///
/// Lost or refused connections, pool exhaustion and server shutdowns are
/// transient. Everything the server rejected for schema or data reasons is
/// not.
pub fn classify(err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    };

    if transient {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Rejected(err.to_string())
    }
}

pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub fn qualified(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote(schema), quote(table)),
        None => quote(table),
    }
}

pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote(schema))
}

pub fn drop_table_sql(schema: Option<&str>, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", qualified(schema, table))
}

pub fn create_table_sql(schema: Option<&str>, layout: &Layout) -> String {
    let columns: Vec<String> = layout
        .columns
        .iter()
        .map(|c| format!("{} {}", quote(&c.name), c.kind.sql_type()))
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        qualified(schema, &layout.table),
        columns.join(", ")
    )
}

pub fn copy_sql(schema: Option<&str>, layout: &Layout) -> String {
    let columns: Vec<String> = layout.column_names().map(quote).collect();
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        qualified(schema, &layout.table),
        columns.join(", ")
    )
}

pub fn create_index_sql(schema: Option<&str>, index: &IndexSpec) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING hash ({})",
        quote(&index.name),
        qualified(schema, &index.table),
        quote(&index.column)
    )
}
