//! Summary statistics over the loaded trips

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::TargetConfig;
use crate::ledger::{ImportLedger, LEDGER_TABLE};
use crate::schema::{quote_ident, SchemaError, SchemaReconciler, TableSchema};

const PICKUP_SUFFIX: &str = "pickup_datetime";
const TRIP_DISTANCE: &str = "trip_distance";
const FARE_AMOUNT: &str = "fare_amount";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TripStatistics {
    pub total_trips: i64,
    #[sqlx(default)]
    pub total_files: i64,
    pub first_pickup: Option<NaiveDateTime>,
    pub last_pickup: Option<NaiveDateTime>,
    pub average_trip_distance: Option<f64>,
    pub average_fare_amount: Option<f64>,
}

/// `tpep_pickup_datetime` for yellow cabs, `lpep_pickup_datetime` for green
fn pickup_column(schema: &TableSchema) -> Option<&str> {
    schema.names().find(|name| name.ends_with(PICKUP_SUFFIX))
}

fn aggregate(function: &str, column: Option<&str>, cast: &str) -> String {
    match column {
        Some(column) => format!("{}({})::{}", function, quote_ident(column), cast),
        None => format!("NULL::{}", cast),
    }
}

/// Build the statistics query for whatever columns the table has
pub(crate) fn statistics_sql(table: &str, schema: &TableSchema) -> String {
    let pickup = pickup_column(schema);
    let distance = schema.column(TRIP_DISTANCE).map(|c| c.name.as_str());
    let fare = schema.column(FARE_AMOUNT).map(|c| c.name.as_str());

    format!(
        "SELECT COUNT(*)::int8 AS total_trips, {} AS first_pickup, {} AS last_pickup, \
         {} AS average_trip_distance, {} AS average_fare_amount FROM {}",
        aggregate("MIN", pickup, "timestamp"),
        aggregate("MAX", pickup, "timestamp"),
        aggregate("AVG", distance, "float8"),
        aggregate("AVG", fare, "float8"),
        table,
    )
}

/// Collect statistics for the target table. A table that does not exist
/// yet reports zero trips.
pub async fn collect(pool: &PgPool, target: &TargetConfig) -> Result<TripStatistics, SchemaError> {
    let reconciler = SchemaReconciler::new(pool.clone(), target.clone())?;
    let ledger = ImportLedger::new(pool.clone(), &target.schema)?;

    let mut stats = match reconciler.describe_existing().await? {
        Some(schema) => {
            let sql = statistics_sql(&reconciler.table_name()?, &schema);
            sqlx::query_as::<_, TripStatistics>(&sql).fetch_one(pool).await?
        },
        None => TripStatistics::default(),
    };

    let ledger_exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )
        "#,
    )
    .bind(&target.schema)
    .bind(LEDGER_TABLE)
    .fetch_one(pool)
    .await?;
    if ledger_exists {
        stats.total_files = ledger.count().await?;
    }

    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, PgType};

    fn column(name: &str, pg_type: PgType) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            pg_type,
            nullable: true,
        }
    }

    #[test]
    fn test_full_trip_table() {
        let schema = TableSchema {
            columns: vec![
                column("tpep_pickup_datetime", PgType::Timestamp),
                column("trip_distance", PgType::DoublePrecision),
                column("fare_amount", PgType::DoublePrecision),
            ],
        };
        let sql = statistics_sql("\"public\".\"trips\"", &schema);
        assert!(sql.contains("MIN(\"tpep_pickup_datetime\")::timestamp AS first_pickup"));
        assert!(sql.contains("AVG(\"trip_distance\")::float8 AS average_trip_distance"));
        assert!(sql.ends_with("FROM \"public\".\"trips\""));
    }

    #[test]
    fn test_missing_columns_become_null() {
        let schema = TableSchema {
            columns: vec![column("vendor_id", PgType::Integer)],
        };
        let sql = statistics_sql("t", &schema);
        assert!(sql.contains("NULL::timestamp AS first_pickup"));
        assert!(sql.contains("NULL::float8 AS average_fare_amount"));
    }

    #[test]
    fn test_green_pickup_column() {
        let schema = TableSchema {
            columns: vec![column("lpep_pickup_datetime", PgType::Timestamp)],
        };
        assert_eq!(pickup_column(&schema), Some("lpep_pickup_datetime"));
    }
}
