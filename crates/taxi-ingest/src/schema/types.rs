//! Source logical types and the destination types they map to

use arrow::datatypes::{DataType, Field};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Arrow extension metadata key
const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";
const UUID_EXTENSION: &str = "arrow.uuid";

/// Logical type of a source column, independent of how it was described
/// (Parquet/Arrow schema or an analytic store's catalog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    HugeInt,
    Float32,
    Float64,
    Decimal {
        precision: Option<u16>,
        scale: Option<i16>,
    },
    String,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    /// Anything the lookup table does not know; stored as text
    Other(String),
}

/// Destination column type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PgType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Numeric {
        precision: Option<u16>,
        scale: Option<u16>,
    },
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    /// Existing destination type the pipeline never creates itself
    Other(String),
}

impl LogicalType {
    /// Logical type of an Arrow field as produced by the Parquet reader.
    pub fn from_arrow(field: &Field) -> Self {
        let is_uuid = field
            .metadata()
            .get(EXTENSION_NAME_KEY)
            .is_some_and(|name| name == UUID_EXTENSION);
        if is_uuid && matches!(field.data_type(), DataType::FixedSizeBinary(16)) {
            return LogicalType::Uuid;
        }
        Self::from_arrow_type(field.data_type())
    }

    pub fn from_arrow_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => LogicalType::Boolean,
            DataType::Int8 => LogicalType::Int8,
            DataType::Int16 => LogicalType::Int16,
            DataType::Int32 => LogicalType::Int32,
            DataType::Int64 => LogicalType::Int64,
            DataType::UInt8 => LogicalType::UInt8,
            DataType::UInt16 => LogicalType::UInt16,
            DataType::UInt32 => LogicalType::UInt32,
            DataType::UInt64 => LogicalType::UInt64,
            DataType::Float16 | DataType::Float32 => LogicalType::Float32,
            DataType::Float64 => LogicalType::Float64,
            DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
                LogicalType::Decimal {
                    precision: Some(u16::from(*precision)),
                    scale: Some(i16::from(*scale)),
                }
            },
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => LogicalType::String,
            DataType::Binary
            | DataType::LargeBinary
            | DataType::BinaryView
            | DataType::FixedSizeBinary(_) => LogicalType::Binary,
            DataType::Date32 | DataType::Date64 => LogicalType::Date,
            DataType::Time32(_) | DataType::Time64(_) => LogicalType::Time,
            DataType::Timestamp(_, None) => LogicalType::Timestamp,
            DataType::Timestamp(_, Some(_)) => LogicalType::TimestampTz,
            DataType::Dictionary(_, value_type) => Self::from_arrow_type(value_type),
            other => LogicalType::Other(other.to_string()),
        }
    }

    /// Parse a catalog type name such as `BIGINT`, `DECIMAL(10,2)` or
    /// `TIMESTAMP WITH TIME ZONE`.
    pub fn from_catalog(type_name: &str) -> Self {
        let normalized = type_name.trim().to_uppercase();
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(decimal) = parse_decimal(&normalized) {
            return decimal;
        }

        match normalized.as_str() {
            "BOOLEAN" | "BOOL" | "LOGICAL" => LogicalType::Boolean,
            "TINYINT" | "INT1" => LogicalType::Int8,
            "SMALLINT" | "INT2" | "SHORT" => LogicalType::Int16,
            "INTEGER" | "INT" | "INT4" | "SIGNED" => LogicalType::Int32,
            "BIGINT" | "INT8" | "LONG" => LogicalType::Int64,
            "UTINYINT" => LogicalType::UInt8,
            "USMALLINT" => LogicalType::UInt16,
            "UINTEGER" => LogicalType::UInt32,
            "UBIGINT" => LogicalType::UInt64,
            "HUGEINT" | "INT128" => LogicalType::HugeInt,
            "FLOAT" | "FLOAT4" | "REAL" => LogicalType::Float32,
            "DOUBLE" | "FLOAT8" | "DOUBLE PRECISION" => LogicalType::Float64,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" => LogicalType::String,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => LogicalType::Binary,
            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP_US" | "TIMESTAMP_MS" | "TIMESTAMP_NS"
            | "TIMESTAMP_S" => LogicalType::Timestamp,
            "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => LogicalType::TimestampTz,
            "UUID" => LogicalType::Uuid,
            _ if normalized.starts_with("VARCHAR(") => LogicalType::String,
            _ => LogicalType::Other(type_name.trim().to_string()),
        }
    }

    /// Destination type for this logical type. Total: unknown types become TEXT.
    pub fn to_pg(&self) -> PgType {
        match self {
            LogicalType::Boolean => PgType::Boolean,
            LogicalType::Int8 | LogicalType::Int16 | LogicalType::UInt8 => PgType::SmallInt,
            LogicalType::Int32 | LogicalType::UInt16 => PgType::Integer,
            LogicalType::Int64 | LogicalType::UInt32 => PgType::BigInt,
            LogicalType::UInt64 => PgType::Numeric {
                precision: Some(20),
                scale: Some(0),
            },
            LogicalType::HugeInt => PgType::Numeric {
                precision: Some(38),
                scale: Some(0),
            },
            LogicalType::Float32 => PgType::Real,
            LogicalType::Float64 => PgType::DoublePrecision,
            LogicalType::Decimal {
                precision: Some(precision),
                scale: Some(scale),
            } if *precision > 0 && *scale >= 0 && (*scale as u16) <= *precision => {
                PgType::Numeric {
                    precision: Some(*precision),
                    scale: Some(*scale as u16),
                }
            },
            LogicalType::Decimal { .. } => PgType::Numeric {
                precision: None,
                scale: None,
            },
            LogicalType::String => PgType::Text,
            LogicalType::Binary => PgType::Bytea,
            LogicalType::Date => PgType::Date,
            LogicalType::Time => PgType::Time,
            LogicalType::Timestamp => PgType::Timestamp,
            LogicalType::TimestampTz => PgType::TimestampTz,
            LogicalType::Uuid => PgType::Uuid,
            LogicalType::Other(_) => PgType::Text,
        }
    }
}

fn parse_decimal(type_name: &str) -> Option<LogicalType> {
    let rest = type_name
        .strip_prefix("DECIMAL")
        .or_else(|| type_name.strip_prefix("NUMERIC"))?
        .trim();
    if rest.is_empty() {
        return Some(LogicalType::Decimal {
            precision: None,
            scale: None,
        });
    }

    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    let (precision, scale) = match inner.split_once(',') {
        Some((p, s)) => (p.trim().parse().ok()?, s.trim().parse().ok()?),
        None => (inner.trim().parse().ok()?, 0),
    };
    Some(LogicalType::Decimal {
        precision: Some(precision),
        scale: Some(scale),
    })
}

impl PgType {
    /// Type as read back from `information_schema.columns`.
    pub fn from_information_schema(
        data_type: &str,
        numeric_precision: Option<i32>,
        numeric_scale: Option<i32>,
    ) -> Self {
        match data_type {
            "boolean" => PgType::Boolean,
            "smallint" => PgType::SmallInt,
            "integer" => PgType::Integer,
            "bigint" => PgType::BigInt,
            "real" => PgType::Real,
            "double precision" => PgType::DoublePrecision,
            "numeric" => PgType::Numeric {
                precision: numeric_precision.and_then(|p| u16::try_from(p).ok()),
                scale: numeric_scale.and_then(|s| u16::try_from(s).ok()),
            },
            "text" | "character varying" | "character" => PgType::Text,
            "bytea" => PgType::Bytea,
            "date" => PgType::Date,
            "time without time zone" => PgType::Time,
            "timestamp without time zone" => PgType::Timestamp,
            "timestamp with time zone" => PgType::TimestampTz,
            "uuid" => PgType::Uuid,
            other => PgType::Other(other.to_string()),
        }
    }

    /// Type name as written in DDL
    pub fn sql(&self) -> String {
        match self {
            PgType::Boolean => "BOOLEAN".to_string(),
            PgType::SmallInt => "SMALLINT".to_string(),
            PgType::Integer => "INTEGER".to_string(),
            PgType::BigInt => "BIGINT".to_string(),
            PgType::Real => "REAL".to_string(),
            PgType::DoublePrecision => "DOUBLE PRECISION".to_string(),
            PgType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({},{})", p, s),
            PgType::Numeric {
                precision: Some(p),
                scale: None,
            } => format!("NUMERIC({})", p),
            PgType::Numeric { .. } => "NUMERIC".to_string(),
            PgType::Text => "TEXT".to_string(),
            PgType::Bytea => "BYTEA".to_string(),
            PgType::Date => "DATE".to_string(),
            PgType::Time => "TIME".to_string(),
            PgType::Timestamp => "TIMESTAMP".to_string(),
            PgType::TimestampTz => "TIMESTAMPTZ".to_string(),
            PgType::Uuid => "UUID".to_string(),
            PgType::Other(name) => name.clone(),
        }
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}
