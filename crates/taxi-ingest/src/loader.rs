//! Bulk loader
//!
//! Moves every row of one source file into the target table exactly once.
//! A file is one transaction: its batches, the before/after row counts and
//! the ledger entry either all commit or none do. Dropping an import future
//! mid-flight drops the transaction, which rolls it back.

use futures::stream::{self, StreamExt};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::config::{LoaderConfig, TargetConfig};
use crate::error::ImportError;
use crate::ledger::ImportLedger;
use crate::schema::{qualified_name, quote_ident, ColumnNamer, PgType, SchemaError, TableSchema};
use crate::source::{file_name_of, BatchSource, ImportBatch, ParquetSource};
use crate::value::SqlValue;

/// PostgreSQL accepts at most this many bind parameters per statement
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported { rows: u64 },
    /// Already in the ledger; the table was not touched
    Skipped,
}

/// Result of importing one file
#[derive(Debug)]
pub struct FileImport {
    pub file_name: String,
    pub result: Result<ImportOutcome, ImportError>,
    pub elapsed: Duration,
}

impl FileImport {
    pub fn rows_imported(&self) -> u64 {
        match self.result {
            Ok(ImportOutcome::Imported { rows }) => rows,
            _ => 0,
        }
    }
}

/// Loads source files into one target table
pub struct BulkLoader {
    pool: PgPool,
    ledger: ImportLedger,
    table: String,
    destination: TableSchema,
    namer: ColumnNamer,
    config: LoaderConfig,
}

impl BulkLoader {
    /// `destination` is the target table's actual column list, as returned
    /// by [`crate::schema::SchemaReconciler::ensure`].
    pub fn new(
        pool: PgPool,
        target: &TargetConfig,
        destination: TableSchema,
        config: LoaderConfig,
    ) -> Result<Self, SchemaError> {
        Ok(Self {
            ledger: ImportLedger::new(pool.clone(), &target.schema)?,
            table: qualified_name(&target.schema, &target.table)?,
            namer: ColumnNamer::new()?,
            pool,
            destination,
            config,
        })
    }

    pub fn ledger(&self) -> &ImportLedger {
        &self.ledger
    }

    /// Import one Parquet file.
    pub async fn import_file(&self, path: &Path) -> FileImport {
        let started = Instant::now();
        let file_name = file_name_of(path);
        let result = self.import_path(path, &file_name).await;
        FileImport {
            file_name,
            result,
            elapsed: started.elapsed(),
        }
    }

    /// Import from any batch source; the source's file name is the ledger key.
    pub async fn import_source(&self, source: Box<dyn BatchSource>) -> FileImport {
        let started = Instant::now();
        let file_name = source.file_name().to_string();

        let result = if self.ledger.is_imported(&file_name).await {
            info!(file = %file_name, "Already imported, skipping");
            Ok(ImportOutcome::Skipped)
        } else {
            self.load(source).await
        };

        FileImport {
            file_name,
            result,
            elapsed: started.elapsed(),
        }
    }

    /// Import several files with at most [`Self::parallelism`] in flight.
    /// Results come back in input order.
    pub async fn import_files(&self, paths: &[PathBuf]) -> Vec<FileImport> {
        stream::iter(paths)
            .map(|path| self.import_file(path))
            .buffered(self.parallelism())
            .collect()
            .await
    }

    /// Files imported at once: `max_parallel_files`, capped at the pool size.
    /// Every in-flight file holds one connection for its whole transaction.
    pub fn parallelism(&self) -> usize {
        let pool_size = self.pool.options().get_max_connections() as usize;
        let requested = self.config.max_parallel_files.max(1);
        if requested > pool_size {
            debug!(requested, pool_size, "Capping parallel files at the pool size");
        }
        requested.min(pool_size).max(1)
    }

    async fn import_path(&self, path: &Path, file_name: &str) -> Result<ImportOutcome, ImportError> {
        if self.ledger.is_imported(file_name).await {
            info!(file = %file_name, "Already imported, skipping");
            return Ok(ImportOutcome::Skipped);
        }

        let owned = path.to_path_buf();
        let chunk_size = self.config.chunk_size;
        let source = tokio::task::spawn_blocking(move || ParquetSource::open(&owned, chunk_size))
            .await
            .map_err(|e| ImportError::source_read(file_name, e))??;

        self.load(Box::new(source)).await
    }

    #[instrument(skip(self, source), fields(file = %source.file_name()))]
    async fn load(&self, source: Box<dyn BatchSource>) -> Result<ImportOutcome, ImportError> {
        let file_name = source.file_name().to_string();
        let plan = InsertPlan::new(&self.table, &self.destination, &self.namer, source.columns())?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        // Another run may have committed this file since the pre-check
        if self.ledger.is_imported_in(&mut tx, &file_name).await? {
            info!("Imported concurrently, skipping");
            return Ok(ImportOutcome::Skipped);
        }

        let count_sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count_before = sqlx::query_scalar::<_, i64>(&count_sql).fetch_one(&mut *tx).await?;

        let (sender, mut receiver) = mpsc::channel::<Result<ImportBatch, ImportError>>(1);
        let reader = tokio::task::spawn_blocking(move || {
            let mut source = source;
            loop {
                match source.next_batch() {
                    Ok(Some(batch)) => {
                        if sender.blocking_send(Ok(batch)).is_err() {
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        let _ = sender.blocking_send(Err(e));
                        break;
                    },
                }
            }
        });

        let mut rows_read: u64 = 0;
        let mut batches: usize = 0;
        while let Some(batch) = receiver.recv().await {
            let batch = batch?;
            rows_read += batch.len() as u64;
            batches += 1;
            plan.insert(&mut tx, batch).await?;
        }
        reader
            .await
            .map_err(|e| ImportError::source_read(&file_name, e))?;

        let count_after = sqlx::query_scalar::<_, i64>(&count_sql).fetch_one(&mut *tx).await?;
        let rows = count_after - count_before;
        debug!(batches, rows_read, rows, "Transfer complete");

        self.ledger.record(&mut tx, &file_name, rows).await?;
        tx.commit().await?;

        info!(rows, batches, "File imported");
        Ok(ImportOutcome::Imported {
            rows: u64::try_from(rows).unwrap_or(0),
        })
    }
}

/// Column mapping and statement shape for one source file
struct InsertPlan {
    insert_prefix: String,
    /// Per inserted column: source position, destination name and type
    columns: Vec<(usize, String, PgType)>,
    types: Vec<PgType>,
    rows_per_statement: usize,
}

impl InsertPlan {
    fn new(
        table: &str,
        destination: &TableSchema,
        namer: &ColumnNamer,
        source: &[crate::schema::SourceColumn],
    ) -> Result<Self, ImportError> {
        let names = namer
            .normalize_all(source.iter().map(|c| c.name.as_str()))
            .map_err(|e| ImportError::SchemaMismatch(e.to_string()))?;

        let mut columns = Vec::with_capacity(names.len());
        for (position, name) in names.into_iter().enumerate() {
            let target = destination.column(&name).ok_or_else(|| {
                ImportError::SchemaMismatch(format!("column '{}' does not exist in {}", name, table))
            })?;
            columns.push((position, name, target.pg_type.clone()));
        }

        if columns.is_empty() {
            return Err(ImportError::SchemaMismatch("source file has no columns".to_string()));
        }

        let column_list = columns
            .iter()
            .map(|(_, name, _)| quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Self {
            insert_prefix: format!("INSERT INTO {} ({}) ", table, column_list),
            types: columns.iter().map(|(_, _, pg_type)| pg_type.clone()).collect(),
            rows_per_statement: (MAX_BIND_PARAMETERS / columns.len()).max(1),
            columns,
        })
    }

    /// Coerce every value of the batch into its destination type.
    fn coerce(&self, batch: ImportBatch) -> Result<Vec<Vec<SqlValue>>, ImportError> {
        let offset = batch.offset;
        batch
            .rows
            .into_iter()
            .enumerate()
            .map(|(index, mut row)| {
                let row_number = offset + index as u64;
                self.columns
                    .iter()
                    .map(|(position, name, pg_type)| {
                        let value = row.get_mut(*position).map(std::mem::take).ok_or_else(|| {
                            ImportError::SchemaMismatch(format!(
                                "row {} has no value for column '{}'",
                                row_number, name
                            ))
                        })?;
                        value.coerce(pg_type).map_err(|reason| {
                            ImportError::SchemaMismatch(format!(
                                "column '{}', row {}: {}",
                                name, row_number, reason
                            ))
                        })
                    })
                    .collect()
            })
            .collect()
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: ImportBatch,
    ) -> Result<(), ImportError> {
        let mut rows = self.coerce(batch)?.into_iter().peekable();

        while rows.peek().is_some() {
            let chunk: Vec<Vec<SqlValue>> = rows.by_ref().take(self.rows_per_statement).collect();

            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(&self.insert_prefix);
            query_builder.push_values(chunk, |mut b, values| {
                for (value, pg_type) in values.into_iter().zip(&self.types) {
                    value.push_bind(pg_type, &mut b);
                }
            });

            query_builder.build().execute(&mut **tx).await?;
        }

        Ok(())
    }
}
