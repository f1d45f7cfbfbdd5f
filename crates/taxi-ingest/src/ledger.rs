//! Import ledger
//!
//! One row per source file whose rows are fully committed to the target
//! table. Entries are only ever written inside the same transaction as the
//! file's rows, so an entry existing implies the data exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};

use crate::error::ImportError;
use crate::schema::{qualified_name, tolerate_existing, SchemaError};

pub const LEDGER_TABLE: &str = "import_log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub file_name: String,
    pub import_date: DateTime<Utc>,
    pub rows_imported: i64,
}

#[derive(Debug, Clone)]
pub struct ImportLedger {
    pool: PgPool,
    table: String,
}

impl ImportLedger {
    /// Ledger living in `schema`, next to the target table
    pub fn new(pool: PgPool, schema: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            pool,
            table: qualified_name(schema, LEDGER_TABLE)?,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<(), sqlx::Error> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                file_name TEXT PRIMARY KEY,
                import_date TIMESTAMPTZ NOT NULL DEFAULT now(),
                rows_imported BIGINT NOT NULL
            )
            "#,
            self.table
        );
        tolerate_existing(sqlx::query(&ddl).execute(&self.pool).await)
    }

    /// Whether `file_name` has been fully imported.
    ///
    /// A ledger that cannot be read answers `false`: the import is then
    /// attempted and the in-transaction check or the ledger insert decides.
    pub async fn is_imported(&self, file_name: &str) -> bool {
        match self.lookup(&self.pool, file_name).await {
            Ok(found) => found,
            Err(e) => {
                warn!(file = %file_name, error = %e, "Import ledger lookup failed; treating file as not imported");
                false
            },
        }
    }

    /// Strict lookup on the caller's connection (usually a load transaction).
    pub async fn is_imported_in(
        &self,
        conn: &mut PgConnection,
        file_name: &str,
    ) -> Result<bool, sqlx::Error> {
        self.lookup(conn, file_name).await
    }

    async fn lookup<'e, E>(&self, executor: E, file_name: &str) -> Result<bool, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE file_name = $1)", self.table);
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(file_name)
            .fetch_one(executor)
            .await
    }

    /// Record a completed import inside the caller's transaction.
    pub async fn record(
        &self,
        conn: &mut PgConnection,
        file_name: &str,
        rows_imported: i64,
    ) -> Result<(), ImportError> {
        let sql = format!(
            "INSERT INTO {} (file_name, rows_imported) VALUES ($1, $2) ON CONFLICT (file_name) DO NOTHING",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(file_name)
            .bind(rows_imported)
            .execute(conn)
            .await
            .map_err(|e| ImportError::from_ledger_insert(file_name, e))?;

        if result.rows_affected() == 0 {
            return Err(ImportError::LedgerConflict(file_name.to_string()));
        }

        debug!(file = %file_name, rows = rows_imported, "Recorded import");
        Ok(())
    }

    /// All entries, ordered by file name
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let sql = format!(
            "SELECT file_name, import_date, rows_imported FROM {} ORDER BY file_name",
            self.table
        );
        sqlx::query_as::<_, LedgerEntry>(&sql).fetch_all(&self.pool).await
    }

    pub async fn entry(&self, file_name: &str) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let sql = format!(
            "SELECT file_name, import_date, rows_imported FROM {} WHERE file_name = $1",
            self.table
        );
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_table_name_is_qualified() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        let ledger = ImportLedger::new(pool.clone(), "taxi").unwrap();
        assert_eq!(ledger.table_name(), "\"taxi\".\"import_log\"");
        assert!(ImportLedger::new(pool, "").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_reads_as_not_imported() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgresql://postgres@127.0.0.1:1/unreachable")
            .unwrap();
        let ledger = ImportLedger::new(pool, "public").unwrap();
        assert!(!ledger.is_imported("yellow_tripdata_2024-01.parquet").await);
    }
}
