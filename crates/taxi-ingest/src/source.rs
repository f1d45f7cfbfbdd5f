//! Source files and the batches read from them

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{
    ArrowPrimitiveType, ArrowTemporalType, ArrowTimestampType, DataType, Date32Type, Date64Type,
    Decimal128Type, Decimal256Type, DecimalType, Field, Float16Type, Float32Type, Float64Type,
    Int16Type, Int32Type, Int64Type, Int8Type, SchemaRef, Time32MillisecondType,
    Time32SecondType, Time64MicrosecondType, Time64NanosecondType, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use sqlx::types::BigDecimal;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ImportError;
use crate::schema::{LogicalType, SourceColumn};
use crate::value::SqlValue;

/// Bounded slice of a source file's rows, in file order
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    /// Row offset of the first row within the file
    pub offset: u64,
    /// Source column names, in file order
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ImportBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Something the loader can pull batches from.
///
/// Implementations are driven from a blocking thread, one batch at a time.
pub trait BatchSource: Send {
    /// Identity of the file; the ledger key
    fn file_name(&self) -> &str;

    fn columns(&self) -> &[SourceColumn];

    /// Next batch, or `None` once the file is exhausted
    fn next_batch(&mut self) -> Result<Option<ImportBatch>, ImportError>;
}

/// Reads a Parquet file in batches of `chunk_size` rows
pub struct ParquetSource {
    file_name: String,
    columns: Vec<SourceColumn>,
    schema: SchemaRef,
    reader: ParquetRecordBatchReader,
    offset: u64,
}

impl ParquetSource {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, ImportError> {
        let file_name = file_name_of(path);
        let file = File::open(path).map_err(|e| ImportError::source_read(&file_name, e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| ImportError::source_read(&file_name, e))?;

        let schema = builder.schema().clone();
        let columns = source_columns(&schema);
        let reader = builder
            .with_batch_size(chunk_size.max(1))
            .build()
            .map_err(|e| ImportError::source_read(&file_name, e))?;

        Ok(Self {
            file_name,
            columns,
            schema,
            reader,
            offset: 0,
        })
    }
}

impl BatchSource for ParquetSource {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn columns(&self) -> &[SourceColumn] {
        &self.columns
    }

    fn next_batch(&mut self) -> Result<Option<ImportBatch>, ImportError> {
        let batch = match self.reader.next() {
            None => return Ok(None),
            Some(batch) => batch.map_err(|e| ImportError::source_read(&self.file_name, e))?,
        };

        let rows = record_batch_rows(&batch, &self.schema)
            .map_err(|e| ImportError::source_read(&self.file_name, e))?;

        let import = ImportBatch {
            offset: self.offset,
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
        };
        self.offset += import.len() as u64;
        Ok(Some(import))
    }
}

/// Column list of a Parquet file, read from its footer only.
pub fn read_schema(path: &Path) -> Result<Vec<SourceColumn>, ImportError> {
    let file_name = file_name_of(path);
    let file = File::open(path).map_err(|e| ImportError::source_read(&file_name, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| ImportError::source_read(&file_name, e))?;
    Ok(source_columns(builder.schema()))
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn source_columns(schema: &SchemaRef) -> Vec<SourceColumn> {
    schema
        .fields()
        .iter()
        .map(|field| SourceColumn {
            name: field.name().clone(),
            logical_type: LogicalType::from_arrow(field),
            nullable: field.is_nullable(),
        })
        .collect()
}

/// Transpose a column-major Arrow batch into typed rows.
pub fn record_batch_rows(
    batch: &RecordBatch,
    schema: &SchemaRef,
) -> Result<Vec<Vec<SqlValue>>, ArrowError> {
    let width = batch.num_columns();
    let mut rows: Vec<Vec<SqlValue>> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(width))
        .collect();

    for (array, field) in batch.columns().iter().zip(schema.fields().iter()) {
        let values = column_values(array, field)?;
        for (row, value) in rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    Ok(rows)
}

fn column_values(array: &ArrayRef, field: &Field) -> Result<Vec<SqlValue>, ArrowError> {
    if matches!(LogicalType::from_arrow(field), LogicalType::Uuid) {
        let binary = array.as_fixed_size_binary();
        return (0..binary.len())
            .map(|i| {
                if binary.is_null(i) {
                    return Ok(SqlValue::Null);
                }
                Uuid::from_slice(binary.value(i))
                    .map(SqlValue::Uuid)
                    .map_err(|e| ArrowError::ParseError(e.to_string()))
            })
            .collect();
    }
    array_values(array)
}

fn array_values(array: &ArrayRef) -> Result<Vec<SqlValue>, ArrowError> {
    let values = match array.data_type() {
        DataType::Null => vec![SqlValue::Null; array.len()],
        DataType::Boolean => {
            let a = array.as_boolean();
            (0..a.len())
                .map(|i| if a.is_null(i) { SqlValue::Null } else { SqlValue::Bool(a.value(i)) })
                .collect()
        },
        DataType::Int8 => primitive::<Int8Type>(array, |v| SqlValue::Int16(i16::from(v))),
        DataType::Int16 => primitive::<Int16Type>(array, SqlValue::Int16),
        DataType::Int32 => primitive::<Int32Type>(array, SqlValue::Int32),
        DataType::Int64 => primitive::<Int64Type>(array, SqlValue::Int64),
        DataType::UInt8 => primitive::<UInt8Type>(array, |v| SqlValue::Int16(i16::from(v))),
        DataType::UInt16 => primitive::<UInt16Type>(array, |v| SqlValue::Int32(i32::from(v))),
        DataType::UInt32 => primitive::<UInt32Type>(array, |v| SqlValue::Int64(i64::from(v))),
        DataType::UInt64 => primitive::<UInt64Type>(array, SqlValue::UInt64),
        DataType::Float16 => primitive::<Float16Type>(array, |v| SqlValue::Float32(v.to_f32())),
        DataType::Float32 => primitive::<Float32Type>(array, SqlValue::Float32),
        DataType::Float64 => primitive::<Float64Type>(array, SqlValue::Float64),
        DataType::Decimal128(_, _) => decimals::<Decimal128Type>(array)?,
        DataType::Decimal256(_, _) => decimals::<Decimal256Type>(array)?,
        DataType::Utf8 => {
            let a = array.as_string::<i32>();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string())))
                .collect()
        },
        DataType::LargeUtf8 => {
            let a = array.as_string::<i64>();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string())))
                .collect()
        },
        DataType::Utf8View => {
            let a = array.as_string_view();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string())))
                .collect()
        },
        DataType::Binary => {
            let a = array.as_binary::<i32>();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |b| SqlValue::Bytes(b.to_vec())))
                .collect()
        },
        DataType::LargeBinary => {
            let a = array.as_binary::<i64>();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |b| SqlValue::Bytes(b.to_vec())))
                .collect()
        },
        DataType::BinaryView => {
            let a = array.as_binary_view();
            a.iter()
                .map(|v| v.map_or(SqlValue::Null, |b| SqlValue::Bytes(b.to_vec())))
                .collect()
        },
        DataType::FixedSizeBinary(_) => {
            let a = array.as_fixed_size_binary();
            (0..a.len())
                .map(|i| if a.is_null(i) { SqlValue::Null } else { SqlValue::Bytes(a.value(i).to_vec()) })
                .collect()
        },
        DataType::Date32 => temporal::<Date32Type, _>(array, |a, i| a.value_as_date(i).map(SqlValue::Date))?,
        DataType::Date64 => temporal::<Date64Type, _>(array, |a, i| a.value_as_date(i).map(SqlValue::Date))?,
        DataType::Time32(TimeUnit::Second) => times::<Time32SecondType>(array)?,
        DataType::Time32(TimeUnit::Millisecond) => times::<Time32MillisecondType>(array)?,
        DataType::Time64(TimeUnit::Microsecond) => times::<Time64MicrosecondType>(array)?,
        DataType::Time64(TimeUnit::Nanosecond) => times::<Time64NanosecondType>(array)?,
        DataType::Timestamp(unit, tz) => {
            let zoned = tz.is_some();
            match unit {
                TimeUnit::Second => timestamps::<TimestampSecondType>(array, zoned)?,
                TimeUnit::Millisecond => timestamps::<TimestampMillisecondType>(array, zoned)?,
                TimeUnit::Microsecond => timestamps::<TimestampMicrosecondType>(array, zoned)?,
                TimeUnit::Nanosecond => timestamps::<TimestampNanosecondType>(array, zoned)?,
            }
        },
        DataType::Dictionary(_, value_type) => {
            let decoded = cast(array.as_ref(), value_type)?;
            array_values(&decoded)?
        },
        _ => formatted(array)?,
    };
    Ok(values)
}

fn primitive<T: ArrowPrimitiveType>(
    array: &ArrayRef,
    convert: impl Fn(T::Native) -> SqlValue,
) -> Vec<SqlValue> {
    let a = array.as_primitive::<T>();
    (0..a.len())
        .map(|i| if a.is_null(i) { SqlValue::Null } else { convert(a.value(i)) })
        .collect()
}

fn decimals<T: DecimalType>(array: &ArrayRef) -> Result<Vec<SqlValue>, ArrowError> {
    let a = array.as_primitive::<T>();
    (0..a.len())
        .map(|i| {
            if a.is_null(i) {
                return Ok(SqlValue::Null);
            }
            BigDecimal::from_str(&a.value_as_string(i))
                .map(SqlValue::Decimal)
                .map_err(|e| ArrowError::ParseError(e.to_string()))
        })
        .collect()
}

fn temporal<T, F>(array: &ArrayRef, convert: F) -> Result<Vec<SqlValue>, ArrowError>
where
    T: ArrowTemporalType,
    F: Fn(&arrow::array::PrimitiveArray<T>, usize) -> Option<SqlValue>,
{
    let a = array.as_primitive::<T>();
    (0..a.len())
        .map(|i| {
            if a.is_null(i) {
                return Ok(SqlValue::Null);
            }
            convert(a, i).ok_or_else(|| {
                ArrowError::ComputeError(format!("{} value out of range at row {}", a.data_type(), i))
            })
        })
        .collect()
}

fn times<T>(array: &ArrayRef) -> Result<Vec<SqlValue>, ArrowError>
where
    T: ArrowTemporalType,
    i64: From<T::Native>,
{
    temporal::<T, _>(array, |a, i| a.value_as_time(i).map(SqlValue::Time))
}

fn timestamps<T>(array: &ArrayRef, zoned: bool) -> Result<Vec<SqlValue>, ArrowError>
where
    T: ArrowTimestampType,
    i64: From<T::Native>,
{
    // Stored instants are UTC regardless of the annotated zone
    temporal::<T, _>(array, |a, i| {
        a.value_as_datetime(i).map(|ts| {
            if zoned {
                SqlValue::TimestampTz(ts.and_utc())
            } else {
                SqlValue::Timestamp(ts)
            }
        })
    })
}

/// Render anything without a native mapping as text.
fn formatted(array: &ArrayRef) -> Result<Vec<SqlValue>, ArrowError> {
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
    Ok((0..array.len())
        .map(|i| {
            if array.is_null(i) {
                SqlValue::Null
            } else {
                SqlValue::Text(formatter.value(i).to_string())
            }
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arrow::array::{
        DictionaryArray, Float64Array, Int32Array, Int64Array, ListArray, StringArray,
        TimestampMicrosecondArray,
    };
    use arrow::datatypes::{Int32Type as DictKey, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn write_parquet(path: &Path, batch: &RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("VendorID", DataType::Int32, true),
            Field::new("tpep_pickup_datetime", DataType::Timestamp(TimeUnit::Microsecond, None), true),
            Field::new("fare_amount", DataType::Float64, true),
            Field::new("store_and_fwd_flag", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), Some(2), None, Some(1), Some(2)])),
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(1_704_067_200_000_000),
                    Some(1_704_067_260_000_000),
                    None,
                    Some(1_704_067_320_000_000),
                    Some(1_704_067_380_000_000),
                ])),
                Arc::new(Float64Array::from(vec![Some(12.5), None, Some(3.0), Some(7.25), Some(0.0)])),
                Arc::new(StringArray::from(vec![Some("N"), Some("Y"), None, Some("N"), Some("N")])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parquet_source_batches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-01.parquet");
        write_parquet(&path, &sample_batch());

        let mut source = ParquetSource::open(&path, 2).unwrap();
        assert_eq!(source.file_name(), "yellow_tripdata_2024-01.parquet");
        assert_eq!(source.columns().len(), 4);
        assert_eq!(source.columns()[1].logical_type, LogicalType::Timestamp);

        let mut offsets = Vec::new();
        let mut total = 0;
        while let Some(batch) = source.next_batch().unwrap() {
            assert!(batch.len() <= 2);
            offsets.push(batch.offset);
            total += batch.len();
        }
        assert_eq!(offsets, vec![0, 2, 4]);
        assert_eq!(total, 5);
    }

    #[test]
    fn test_nulls_are_preserved() {
        let batch = sample_batch();
        let rows = record_batch_rows(&batch, &batch.schema()).unwrap();

        assert_eq!(rows[2], vec![SqlValue::Null, SqlValue::Null, SqlValue::Float64(3.0), SqlValue::Null]);
        assert_eq!(rows[1][2], SqlValue::Null);
        assert_eq!(rows[0][3], SqlValue::Text("N".to_string()));
    }

    #[test]
    fn test_timestamp_conversion() {
        let batch = sample_batch();
        let rows = record_batch_rows(&batch, &batch.schema()).unwrap();
        let expected = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(rows[0][1], SqlValue::Timestamp(expected));
    }

    #[test]
    fn test_dictionary_and_nested_columns() {
        let dict: DictionaryArray<DictKey> = vec!["cash", "card", "cash"].into_iter().collect();
        let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
            Some(vec![]),
        ]);
        let schema = Arc::new(Schema::new(vec![
            Field::new("payment", dict.data_type().clone(), false),
            Field::new("legs", list.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(dict), Arc::new(list)]).unwrap();

        let rows = record_batch_rows(&batch, &batch.schema()).unwrap();
        assert_eq!(rows[1][0], SqlValue::Text("card".to_string()));
        assert_eq!(rows[0][1], SqlValue::Text("[1, 2]".to_string()));
        assert_eq!(rows[1][1], SqlValue::Null);
    }

    #[test]
    fn test_unreadable_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-02.parquet");
        std::fs::write(&path, b"definitely not parquet").unwrap();

        let err = ParquetSource::open(&path, 100).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceReadError);
        assert!(read_schema(&path).is_err());
    }

    #[test]
    fn test_read_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("trip_count", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))]).unwrap();
        write_parquet(&path, &batch);

        let columns = read_schema(&path).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].logical_type, LogicalType::Int64);
        assert!(!columns[0].nullable);
    }
}
