//! Parquet encoding and decoding of compacted message partitions.
//!
//! The schema here is the contract with the query layer. `context_date` is a
//! hive partition column: it lives in the object key, not in the row payload.
//! The file carries it once more as key/value metadata so a file can be
//! checked against the key it was found under.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::DateTime;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use chatlake_core::{ContextDate, PARTITION_COLUMN};

use crate::error::{CompactionError, Result};
use crate::flatten::FlattenedRow;

/// Key/value metadata entry holding the partition date.
pub const CONTEXT_DATE_METADATA_KEY: &str = "chatlake.context_date";

const CREATED_BY: &str = "chatlake-compactor";

fn messages_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("message_id", DataType::Int64, false),
        Field::new(
            "message_date",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("message_text", DataType::Utf8, true),
        Field::new("user_first_name", DataType::Utf8, false),
        Field::new("user_id", DataType::Int64, false),
    ]))
}

/// Returns the stored (payload) schema for golden file comparison.
#[must_use]
pub fn message_schema() -> Schema {
    (*messages_schema()).clone()
}

fn writer_properties(date: ContextDate) -> WriterProperties {
    let metadata = vec![
        KeyValue {
            key: "created_by".to_string(),
            value: Some(CREATED_BY.to_string()),
        },
        KeyValue {
            key: CONTEXT_DATE_METADATA_KEY.to_string(),
            value: Some(date.to_string()),
        },
    ];
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(metadata))
        .build()
}

fn encode_error(stage: &str, e: impl std::fmt::Display) -> CompactionError {
    CompactionError::Encode {
        message: format!("{stage}: {e}"),
    }
}

/// Encodes one partition as a single-row-group Parquet file.
///
/// Rows are written in the order given.
///
/// # Errors
///
/// Returns [`CompactionError::Encode`] if a row belongs to another partition,
/// or if the record batch cannot be built or the Parquet write fails.
pub fn write_partition(date: ContextDate, rows: &[FlattenedRow]) -> Result<Bytes> {
    if let Some(stray) = rows.iter().find(|r| r.context_date != date) {
        return Err(CompactionError::Encode {
            message: format!(
                "row {} belongs to {} not {date}",
                stray.message_id, stray.context_date
            ),
        });
    }

    let schema = messages_schema();

    let message_ids = Int64Array::from(rows.iter().map(|r| r.message_id).collect::<Vec<_>>());
    let message_dates = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|r| r.message_date.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let message_texts = StringArray::from(
        rows.iter()
            .map(|r| r.message_text.as_deref())
            .collect::<Vec<_>>(),
    );
    let first_names = StringArray::from(
        rows.iter()
            .map(|r| Some(r.user_first_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let user_ids = Int64Array::from(rows.iter().map(|r| r.user_id).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(message_ids),
            Arc::new(message_dates),
            Arc::new(message_texts),
            Arc::new(first_names),
            Arc::new(user_ids),
        ],
    )
    .map_err(|e| encode_error("record batch build failed", e))?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties(date)))
        .map_err(|e| encode_error("parquet writer init failed", e))?;
    writer
        .write(&batch)
        .map_err(|e| encode_error("parquet write failed", e))?;
    writer
        .close()
        .map_err(|e| encode_error("parquet close failed", e))?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Decoded contents of a published partition.
#[derive(Debug, Clone)]
pub struct PartitionContents {
    /// Partition date recorded in the file metadata, if any.
    pub recorded_date: Option<String>,
    /// Rows with `context_date` filled from the key the file was read under.
    pub rows: Vec<FlattenedRow>,
    /// Column names and types as stored.
    pub columns: Vec<(String, String, bool)>,
}

/// Decodes a partition file read from the key for `date`.
///
/// # Errors
///
/// Returns [`CompactionError::Encode`] if the bytes are not a Parquet file
/// with the message schema.
pub fn read_partition(date: ContextDate, bytes: &Bytes) -> Result<PartitionContents> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
        .map_err(|e| encode_error("parquet reader init failed", e))?;

    let recorded_date = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| {
            kvs.iter()
                .find(|kv| kv.key == CONTEXT_DATE_METADATA_KEY)
                .and_then(|kv| kv.value.clone())
        });
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|f| (f.name().clone(), f.data_type().to_string(), f.is_nullable()))
        .collect();

    let reader = builder
        .build()
        .map_err(|e| encode_error("parquet reader build failed", e))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| encode_error("parquet read batch failed", e))?;
        let message_id = col::<Int64Array>(&batch, "message_id")?;
        let message_date = col::<TimestampMicrosecondArray>(&batch, "message_date")?;
        let message_text = col::<StringArray>(&batch, "message_text")?;
        let first_name = col::<StringArray>(&batch, "user_first_name")?;
        let user_id = col::<Int64Array>(&batch, "user_id")?;

        for row in 0..batch.num_rows() {
            let micros = message_date.value(row);
            let message_date = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| encode_error("timestamp out of range", micros))?;
            rows.push(FlattenedRow {
                message_id: message_id.value(row),
                message_date,
                message_text: (!message_text.is_null(row))
                    .then(|| message_text.value(row).to_string()),
                user_first_name: first_name.value(row).to_string(),
                user_id: user_id.value(row),
                context_date: date,
            });
        }
    }

    Ok(PartitionContents {
        recorded_date,
        rows,
        columns,
    })
}

fn col<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| encode_error(&format!("missing column '{name}'"), e))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CompactionError::Encode {
            message: format!("column '{name}' has unexpected type"),
        })
}

/// Columns the query layer sees: the stored columns plus the partition column.
#[must_use]
pub fn query_columns() -> Vec<String> {
    messages_schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .chain(std::iter::once(PARTITION_COLUMN.to_string()))
        .collect()
}
