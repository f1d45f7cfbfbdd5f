//! Typed cell values
//!
//! Every value read from a source file becomes a [`SqlValue`]. Before it is
//! bound it is coerced once into the destination column's type, so the bind
//! step only ever sees the variant matching that column.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use sqlx::types::BigDecimal;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::schema::PgType;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SqlValue {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Decimal(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int16(_) => "int16",
            SqlValue::Int32(_) => "int32",
            SqlValue::Int64(_) => "int64",
            SqlValue::UInt64(_) => "uint64",
            SqlValue::Float32(_) => "float32",
            SqlValue::Float64(_) => "float64",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
            SqlValue::Timestamp(_) => "timestamp",
            SqlValue::TimestampTz(_) => "timestamptz",
            SqlValue::Uuid(_) => "uuid",
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            SqlValue::Bool(b) => Some(i128::from(*b)),
            SqlValue::Int16(v) => Some(i128::from(*v)),
            SqlValue::Int32(v) => Some(i128::from(*v)),
            SqlValue::Int64(v) => Some(i128::from(*v)),
            SqlValue::UInt64(v) => Some(i128::from(*v)),
            SqlValue::Float32(v) => whole_float(f64::from(*v)),
            SqlValue::Float64(v) => whole_float(*v),
            SqlValue::Decimal(d) => {
                let whole = d.with_scale(0);
                if &whole == d {
                    whole.to_string().parse().ok()
                } else {
                    None
                }
            },
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int16(v) => Some(f64::from(*v)),
            SqlValue::Int32(v) => Some(f64::from(*v)),
            SqlValue::Int64(v) => Some(*v as f64),
            SqlValue::UInt64(v) => Some(*v as f64),
            SqlValue::Float32(v) => Some(f64::from(*v)),
            SqlValue::Float64(v) => Some(*v),
            SqlValue::Decimal(d) => d.to_string().parse().ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert into the representation of `target`. NULL stays NULL.
    /// The error names why the value does not fit.
    pub fn coerce(self, target: &PgType) -> Result<SqlValue, String> {
        if self.is_null() {
            return Ok(SqlValue::Null);
        }

        if let PgType::Text | PgType::Other(_) = target {
            return Ok(match self {
                SqlValue::Text(s) => SqlValue::Text(s),
                other => SqlValue::Text(other.to_string()),
            });
        }

        let reject = |value: &SqlValue| {
            format!("cannot store {} value '{}' as {}", value.type_name(), value, target)
        };

        let coerced = match target {
            PgType::Boolean => match &self {
                SqlValue::Bool(b) => Some(SqlValue::Bool(*b)),
                SqlValue::Text(s) => parse_bool(s).map(SqlValue::Bool),
                other => match other.as_i128() {
                    Some(0) => Some(SqlValue::Bool(false)),
                    Some(1) => Some(SqlValue::Bool(true)),
                    _ => None,
                },
            },
            PgType::SmallInt => self
                .as_i128()
                .and_then(|v| i16::try_from(v).ok())
                .map(SqlValue::Int16),
            PgType::Integer => self
                .as_i128()
                .and_then(|v| i32::try_from(v).ok())
                .map(SqlValue::Int32),
            PgType::BigInt => self
                .as_i128()
                .and_then(|v| i64::try_from(v).ok())
                .map(SqlValue::Int64),
            PgType::Real => match &self {
                SqlValue::Float32(v) => Some(SqlValue::Float32(*v)),
                other => other
                    .as_f64()
                    .filter(|v| !v.is_finite() || v.abs() <= f64::from(f32::MAX))
                    .map(|v| SqlValue::Float32(v as f32)),
            },
            PgType::DoublePrecision => self.as_f64().map(SqlValue::Float64),
            PgType::Numeric { .. } => match &self {
                SqlValue::Decimal(d) => Some(SqlValue::Decimal(d.clone())),
                SqlValue::Int16(v) => Some(SqlValue::Decimal(BigDecimal::from(*v))),
                SqlValue::Int32(v) => Some(SqlValue::Decimal(BigDecimal::from(*v))),
                SqlValue::Int64(v) => Some(SqlValue::Decimal(BigDecimal::from(*v))),
                SqlValue::UInt64(v) => Some(SqlValue::Decimal(BigDecimal::from(*v))),
                SqlValue::Float32(_) | SqlValue::Float64(_) | SqlValue::Text(_) => {
                    BigDecimal::from_str(self.to_string().trim())
                        .ok()
                        .map(SqlValue::Decimal)
                },
                _ => None,
            },
            PgType::Text | PgType::Other(_) => Some(SqlValue::Text(self.to_string())),
            PgType::Bytea => match &self {
                SqlValue::Bytes(b) => Some(SqlValue::Bytes(b.clone())),
                SqlValue::Text(s) => Some(SqlValue::Bytes(s.as_bytes().to_vec())),
                SqlValue::Uuid(u) => Some(SqlValue::Bytes(u.as_bytes().to_vec())),
                _ => None,
            },
            PgType::Date => match &self {
                SqlValue::Date(d) => Some(SqlValue::Date(*d)),
                SqlValue::Timestamp(ts) => Some(SqlValue::Date(ts.date())),
                SqlValue::TimestampTz(ts) => Some(SqlValue::Date(ts.date_naive())),
                SqlValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .map(SqlValue::Date),
                _ => None,
            },
            PgType::Time => match &self {
                SqlValue::Time(t) => Some(SqlValue::Time(*t)),
                SqlValue::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .ok()
                    .map(SqlValue::Time),
                _ => None,
            },
            PgType::Timestamp => match &self {
                SqlValue::Timestamp(ts) => Some(SqlValue::Timestamp(*ts)),
                SqlValue::TimestampTz(ts) => Some(SqlValue::Timestamp(ts.naive_utc())),
                SqlValue::Date(d) => Some(SqlValue::Timestamp(d.and_time(NaiveTime::MIN))),
                SqlValue::Text(s) => parse_timestamp(s).map(SqlValue::Timestamp),
                _ => None,
            },
            PgType::TimestampTz => match &self {
                SqlValue::TimestampTz(ts) => Some(SqlValue::TimestampTz(*ts)),
                SqlValue::Timestamp(ts) => Some(SqlValue::TimestampTz(ts.and_utc())),
                SqlValue::Date(d) => {
                    Some(SqlValue::TimestampTz(d.and_time(NaiveTime::MIN).and_utc()))
                },
                SqlValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|ts| ts.with_timezone(&Utc))
                    .ok()
                    .or_else(|| parse_timestamp(s).map(|ts| ts.and_utc()))
                    .map(SqlValue::TimestampTz),
                _ => None,
            },
            PgType::Uuid => match &self {
                SqlValue::Uuid(u) => Some(SqlValue::Uuid(*u)),
                SqlValue::Text(s) => Uuid::parse_str(s.trim()).ok().map(SqlValue::Uuid),
                SqlValue::Bytes(b) => Uuid::from_slice(b).ok().map(SqlValue::Uuid),
                _ => None,
            },
        };

        match coerced {
            Some(value) => Ok(value),
            None => Err(reject(&self)),
        }
    }

    /// Bind a value already coerced into `pg_type`. NULL is bound with the
    /// column's type so the server never has to guess it.
    pub(crate) fn push_bind(self, pg_type: &PgType, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Null => push_null(pg_type, row),
            SqlValue::Bool(v) => {
                row.push_bind(v);
            },
            SqlValue::Int16(v) => {
                row.push_bind(v);
            },
            SqlValue::Int32(v) => {
                row.push_bind(v);
            },
            SqlValue::Int64(v) => {
                row.push_bind(v);
            },
            SqlValue::UInt64(v) => {
                row.push_bind(BigDecimal::from(v));
            },
            SqlValue::Float32(v) => {
                row.push_bind(v);
            },
            SqlValue::Float64(v) => {
                row.push_bind(v);
            },
            SqlValue::Decimal(v) => {
                row.push_bind(v);
            },
            SqlValue::Text(v) => {
                row.push_bind(v);
            },
            SqlValue::Bytes(v) => {
                row.push_bind(v);
            },
            SqlValue::Date(v) => {
                row.push_bind(v);
            },
            SqlValue::Time(v) => {
                row.push_bind(v);
            },
            SqlValue::Timestamp(v) => {
                row.push_bind(v);
            },
            SqlValue::TimestampTz(v) => {
                row.push_bind(v);
            },
            SqlValue::Uuid(v) => {
                row.push_bind(v);
            },
        }
    }
}

fn push_null(pg_type: &PgType, row: &mut Separated<'_, '_, Postgres, &'static str>) {
    match pg_type {
        PgType::Boolean => {
            row.push_bind(None::<bool>);
        },
        PgType::SmallInt => {
            row.push_bind(None::<i16>);
        },
        PgType::Integer => {
            row.push_bind(None::<i32>);
        },
        PgType::BigInt => {
            row.push_bind(None::<i64>);
        },
        PgType::Real => {
            row.push_bind(None::<f32>);
        },
        PgType::DoublePrecision => {
            row.push_bind(None::<f64>);
        },
        PgType::Numeric { .. } => {
            row.push_bind(None::<BigDecimal>);
        },
        PgType::Text | PgType::Other(_) => {
            row.push_bind(None::<String>);
        },
        PgType::Bytea => {
            row.push_bind(None::<Vec<u8>>);
        },
        PgType::Date => {
            row.push_bind(None::<NaiveDate>);
        },
        PgType::Time => {
            row.push_bind(None::<NaiveTime>);
        },
        PgType::Timestamp => {
            row.push_bind(None::<NaiveDateTime>);
        },
        PgType::TimestampTz => {
            row.push_bind(None::<DateTime<Utc>>);
        },
        PgType::Uuid => {
            row.push_bind(None::<Uuid>);
        },
    }
}

fn whole_float(v: f64) -> Option<i128> {
    if v.is_finite() && v.fract() == 0.0 {
        Some(v as i128)
    } else {
        None
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::Int16(v) => write!(f, "{}", v),
            SqlValue::Int32(v) => write!(f, "{}", v),
            SqlValue::Int64(v) => write!(f, "{}", v),
            SqlValue::UInt64(v) => write!(f, "{}", v),
            SqlValue::Float32(v) => write!(f, "{}", v),
            SqlValue::Float64(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Bytes(bytes) => {
                f.write_str("\\x")?;
                bytes.iter().try_for_each(|b| write!(f, "{:02x}", b))
            },
            SqlValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            SqlValue::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
            SqlValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::TimestampTz(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f%:z")),
            SqlValue::Uuid(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn numeric() -> PgType {
        PgType::Numeric {
            precision: Some(10),
            scale: Some(2),
        }
    }

    #[test]
    fn test_null_survives_every_target() {
        for target in [PgType::Integer, PgType::Text, PgType::Uuid, PgType::TimestampTz, numeric()] {
            assert_eq!(SqlValue::Null.coerce(&target).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_integer_widening_and_range() {
        assert_eq!(SqlValue::Int16(7).coerce(&PgType::BigInt).unwrap(), SqlValue::Int64(7));
        assert_eq!(SqlValue::UInt64(300).coerce(&PgType::Integer).unwrap(), SqlValue::Int32(300));
        assert!(SqlValue::Int64(70_000).coerce(&PgType::SmallInt).is_err());
        assert!(SqlValue::UInt64(u64::MAX).coerce(&PgType::BigInt).is_err());
    }

    #[test]
    fn test_whole_floats_fit_integer_columns() {
        // passenger_count is DOUBLE in some months and BIGINT in others
        assert_eq!(SqlValue::Float64(2.0).coerce(&PgType::BigInt).unwrap(), SqlValue::Int64(2));
        let err = SqlValue::Float64(2.5).coerce(&PgType::BigInt).unwrap_err();
        assert!(err.contains("float64"));
        assert!(SqlValue::Float64(f64::NAN).coerce(&PgType::Integer).is_err());
    }

    #[test]
    fn test_text_targets() {
        assert_eq!(
            SqlValue::Int32(42).coerce(&PgType::Text).unwrap(),
            SqlValue::Text("42".to_string())
        );
        assert_eq!(
            SqlValue::Bytes(vec![0xde, 0xad]).coerce(&PgType::Text).unwrap(),
            SqlValue::Text("\\xdead".to_string())
        );
        assert_eq!(
            SqlValue::Bool(true).coerce(&PgType::Other("varchar".into())).unwrap(),
            SqlValue::Text("true".to_string())
        );
    }

    #[test]
    fn test_uuid_parsing() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        assert_eq!(
            SqlValue::Text(id.to_string()).coerce(&PgType::Uuid).unwrap(),
            SqlValue::Uuid(Uuid::parse_str(id).unwrap())
        );
        assert!(SqlValue::Text("not-a-uuid".into()).coerce(&PgType::Uuid).is_err());
        assert!(SqlValue::Int64(1).coerce(&PgType::Uuid).is_err());
    }

    #[test]
    fn test_temporal_targets() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();

        assert_eq!(
            SqlValue::Timestamp(ts).coerce(&PgType::TimestampTz).unwrap(),
            SqlValue::TimestampTz(ts.and_utc())
        );
        assert_eq!(
            SqlValue::Text("2024-01-15 08:30:00".into()).coerce(&PgType::Timestamp).unwrap(),
            SqlValue::Timestamp(ts)
        );
        assert_eq!(
            SqlValue::Text("2024-01-15T08:30:00Z".into()).coerce(&PgType::TimestampTz).unwrap(),
            SqlValue::TimestampTz(ts.and_utc())
        );
        assert!(SqlValue::Float64(1.5).coerce(&PgType::Timestamp).is_err());
        assert!(SqlValue::Int32(1).coerce(&PgType::Date).is_err());
    }

    #[test]
    fn test_numeric_targets() {
        assert_eq!(
            SqlValue::Text("12.50".into()).coerce(&numeric()).unwrap(),
            SqlValue::Decimal(BigDecimal::from_str("12.50").unwrap())
        );
        assert_eq!(
            SqlValue::UInt64(u64::MAX).coerce(&numeric()).unwrap(),
            SqlValue::Decimal(BigDecimal::from(u64::MAX))
        );
        assert!(SqlValue::Float64(f64::INFINITY).coerce(&numeric()).is_err());
        assert_eq!(
            SqlValue::Decimal(BigDecimal::from_str("3.00").unwrap())
                .coerce(&PgType::Integer)
                .unwrap(),
            SqlValue::Int32(3)
        );
    }

    #[test]
    fn test_boolean_target() {
        assert_eq!(SqlValue::Text("Y".into()).coerce(&PgType::Boolean).unwrap(), SqlValue::Bool(true));
        assert_eq!(SqlValue::Int16(0).coerce(&PgType::Boolean).unwrap(), SqlValue::Bool(false));
        assert!(SqlValue::Int16(2).coerce(&PgType::Boolean).is_err());
    }
}
