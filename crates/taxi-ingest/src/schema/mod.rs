//! Schema reconciliation
//!
//! Derives the destination table definition from one representative source
//! file (or a catalog description of it) and creates the namespace, the
//! table and the import ledger if they do not exist yet. An existing table is
//! never altered; its actual column list is read back and becomes the
//! contract the loader coerces into.

pub mod naming;
pub mod types;

pub use naming::{qualified_name, quote_ident, ColumnNamer};
pub use types::{LogicalType, PgType};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::TargetConfig;
use crate::error::sqlstate;
use crate::ledger::ImportLedger;

/// Concurrent `CREATE ... IF NOT EXISTS` can still lose the catalog race
const DUPLICATE_SCHEMA: &str = "42P06";
const DUPLICATE_TABLE: &str = "42P07";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Column '{0}' appears twice after name normalisation")]
    DuplicateColumn(String),

    #[error("Source describes no columns")]
    EmptySchema,

    #[error("Cannot read sample file: {0}")]
    Source(String),

    #[error("Invalid catalog description: {0}")]
    Catalog(String),

    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A column as the source describes it, before normalisation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

/// A destination column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub pg_type: PgType,
    pub nullable: bool,
}

/// Ordered destination column list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `CREATE TABLE IF NOT EXISTS` for this column list
    pub fn create_table_sql(&self, qualified: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                format!("    {} {}{}", quote_ident(&c.name), c.pg_type.sql(), null)
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", qualified, columns)
    }
}

/// One row of an analytic store's `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub column_name: String,
    pub data_type: String,
    #[serde(default = "default_is_nullable")]
    pub is_nullable: String,
}

fn default_is_nullable() -> String {
    "YES".to_string()
}

impl From<&CatalogColumn> for SourceColumn {
    fn from(column: &CatalogColumn) -> Self {
        SourceColumn {
            name: column.column_name.clone(),
            logical_type: LogicalType::from_catalog(&column.data_type),
            nullable: !column.is_nullable.trim().eq_ignore_ascii_case("NO"),
        }
    }
}

/// Load a catalog description: a JSON array of `CatalogColumn`s.
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogColumn>, SchemaError> {
    let content = std::fs::read_to_string(path)?;
    let columns: Vec<CatalogColumn> = serde_json::from_str(&content)
        .map_err(|e| SchemaError::Catalog(format!("{}: {}", path.display(), e)))?;
    Ok(columns)
}

#[derive(Debug, sqlx::FromRow)]
struct InformationSchemaColumn {
    column_name: String,
    data_type: String,
    is_nullable: String,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
}

/// Creates and describes the destination table
#[derive(Clone)]
pub struct SchemaReconciler {
    pool: PgPool,
    target: TargetConfig,
    namer: ColumnNamer,
}

impl SchemaReconciler {
    pub fn new(pool: PgPool, target: TargetConfig) -> Result<Self, SchemaError> {
        naming::validate_ident(&target.schema)?;
        naming::validate_ident(&target.table)?;
        Ok(Self {
            pool,
            target,
            namer: ColumnNamer::new()?,
        })
    }

    /// Quoted `"schema"."table"`
    pub fn table_name(&self) -> Result<String, SchemaError> {
        qualified_name(&self.target.schema, &self.target.table)
    }

    /// Map source columns to destination columns. Pure; touches nothing.
    pub fn reconcile_columns(&self, source: &[SourceColumn]) -> Result<TableSchema, SchemaError> {
        if source.is_empty() {
            return Err(SchemaError::EmptySchema);
        }

        let names = self.namer.normalize_all(source.iter().map(|c| c.name.as_str()))?;
        let columns = source
            .iter()
            .zip(names)
            .map(|(column, name)| {
                let pg_type = column.logical_type.to_pg();
                if let LogicalType::Other(original) = &column.logical_type {
                    debug!(column = %name, source_type = %original, "Unrecognised type, storing as TEXT");
                }
                ColumnDef {
                    name,
                    pg_type,
                    nullable: column.nullable,
                }
            })
            .collect();

        Ok(TableSchema { columns })
    }

    /// Derive the table definition from a representative source file.
    pub async fn reconcile_from_file(&self, path: &Path) -> Result<TableSchema, SchemaError> {
        let owned = path.to_path_buf();
        let source = tokio::task::spawn_blocking(move || crate::source::read_schema(&owned))
            .await
            .map_err(|e| SchemaError::Source(e.to_string()))?
            .map_err(|e| SchemaError::Source(e.to_string()))?;

        info!(file = %path.display(), columns = source.len(), "Reconciling schema from sample file");
        self.reconcile_columns(&source)
    }

    /// Derive the table definition from a catalog description file.
    pub async fn reconcile_from_catalog(&self, path: &Path) -> Result<TableSchema, SchemaError> {
        let catalog = load_catalog(path)?;
        let source: Vec<SourceColumn> = catalog.iter().map(SourceColumn::from).collect();

        info!(catalog = %path.display(), columns = source.len(), "Reconciling schema from catalog");
        self.reconcile_columns(&source)
    }

    /// Create namespace, table and ledger when missing, then return the
    /// table's actual column list.
    #[instrument(skip(self, schema), fields(table = %self.target.table))]
    pub async fn ensure(&self, schema: &TableSchema) -> Result<TableSchema, SchemaError> {
        let table = self.table_name()?;

        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.target.schema));
        tolerate_existing(sqlx::query(&create_schema).execute(&self.pool).await)?;

        if let Some(existing) = self.describe_existing().await? {
            let missing: Vec<&str> = schema
                .names()
                .filter(|name| existing.column(name).is_none())
                .collect();
            if !missing.is_empty() {
                warn!(
                    table = %table,
                    columns = ?missing,
                    "Existing table lacks columns of the sample; files carrying them will be rejected"
                );
            }
            ImportLedger::new(self.pool.clone(), &self.target.schema)?
                .ensure_table()
                .await?;
            return Ok(existing);
        }

        let ddl = schema.create_table_sql(&table);
        debug!(sql = %ddl, "Creating destination table");
        tolerate_existing(sqlx::query(&ddl).execute(&self.pool).await)?;
        info!(table = %table, columns = schema.columns.len(), "Destination table ready");

        ImportLedger::new(self.pool.clone(), &self.target.schema)?
            .ensure_table()
            .await?;

        match self.describe_existing().await? {
            Some(actual) => Ok(actual),
            None => Ok(schema.clone()),
        }
    }

    /// Column list of the destination table, or `None` when it does not exist.
    pub async fn describe_existing(&self) -> Result<Option<TableSchema>, SchemaError> {
        let rows = sqlx::query_as::<_, InformationSchemaColumn>(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable,
                   numeric_precision::int4 AS numeric_precision,
                   numeric_scale::int4 AS numeric_scale
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.target.schema)
        .bind(&self.target.table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .into_iter()
            .map(|row| ColumnDef {
                pg_type: PgType::from_information_schema(
                    &row.data_type,
                    row.numeric_precision,
                    row.numeric_scale,
                ),
                nullable: row.is_nullable == "YES",
                name: row.column_name,
            })
            .collect();

        Ok(Some(TableSchema { columns }))
    }
}

/// Treat "already exists" outcomes of idempotent DDL as success.
pub(crate) fn tolerate_existing<T>(result: Result<T, sqlx::Error>) -> Result<(), sqlx::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(err) => match sqlstate(&err).as_deref() {
            Some(DUPLICATE_SCHEMA) | Some(DUPLICATE_TABLE) | Some(UNIQUE_VIOLATION) => {
                debug!(error = %err, "Object created concurrently");
                Ok(())
            },
            _ => Err(err),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn source(name: &str, logical_type: LogicalType, nullable: bool) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            logical_type,
            nullable,
        }
    }

    fn reconcile(columns: &[SourceColumn]) -> Result<TableSchema, SchemaError> {
        // reconcile_columns never touches the pool
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        SchemaReconciler::new(pool, TargetConfig::default())
            .unwrap()
            .reconcile_columns(columns)
    }

    #[tokio::test]
    async fn test_reconcile_trip_columns() {
        let schema = reconcile(&[
            source("VendorID", LogicalType::Int32, true),
            source("tpep_pickup_datetime", LogicalType::Timestamp, true),
            source("PULocationID", LogicalType::Int32, false),
            source("Airport_fee", LogicalType::Float64, true),
        ])
        .unwrap();

        let names: Vec<&str> = schema.names().collect();
        assert_eq!(
            names,
            vec!["vendor_id", "tpep_pickup_datetime", "pu_location_id", "airport_fee"]
        );
        assert!(!schema.column("pu_location_id").unwrap().nullable);
        assert_eq!(schema.column("airport_fee").unwrap().pg_type, PgType::DoublePrecision);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_empty_and_duplicate() {
        assert!(matches!(reconcile(&[]), Err(SchemaError::EmptySchema)));
        assert!(matches!(
            reconcile(&[
                source("fare", LogicalType::Float64, true),
                source("Fare", LogicalType::Float64, true),
            ]),
            Err(SchemaError::DuplicateColumn(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_and_sample_agree() {
        let catalog = vec![
            CatalogColumn {
                column_name: "VendorID".into(),
                data_type: "INTEGER".into(),
                is_nullable: "YES".into(),
            },
            CatalogColumn {
                column_name: "fare_amount".into(),
                data_type: "DOUBLE".into(),
                is_nullable: "NO".into(),
            },
        ];
        let from_catalog: Vec<SourceColumn> = catalog.iter().map(SourceColumn::from).collect();
        let from_file = vec![
            source("VendorID", LogicalType::Int32, true),
            source("fare_amount", LogicalType::Float64, false),
        ];

        assert_eq!(reconcile(&from_catalog).unwrap(), reconcile(&from_file).unwrap());
    }

    #[test]
    fn test_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"column_name": "VendorID", "data_type": "BIGINT", "is_nullable": "YES"},
                {"column_name": "congestion_surcharge", "data_type": "DECIMAL(10,2)"}]"#,
        )
        .unwrap();

        let catalog = load_catalog(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[1].is_nullable, "YES");

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_catalog(&path), Err(SchemaError::Catalog(_))));
    }

    #[test]
    fn test_create_table_sql() {
        let schema = TableSchema {
            columns: vec![
                ColumnDef {
                    name: "vendor_id".into(),
                    pg_type: PgType::Integer,
                    nullable: true,
                },
                ColumnDef {
                    name: "trip_distance".into(),
                    pg_type: PgType::DoublePrecision,
                    nullable: false,
                },
            ],
        };
        let sql = schema.create_table_sql("\"public\".\"trips\"");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"trips\""));
        assert!(sql.contains("\"vendor_id\" INTEGER,"));
        assert!(sql.contains("\"trip_distance\" DOUBLE PRECISION NOT NULL"));
    }
}
