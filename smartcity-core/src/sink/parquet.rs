//! Columnar encoding of decoded records. Every part object is one Snappy compressed Parquet file
//! holding a single row group.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::message::{TypedRecord, Value};
use crate::schema::{FieldSpec, FieldType, StreamDefinition, TIMESTAMP_TZ};
use crate::{Error, Result};

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by(format!("smartcity-core {}", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Encodes the records into a Parquet file with the stream's Arrow schema.
pub(crate) fn encode(definition: &StreamDefinition, records: &[TypedRecord]) -> Result<Bytes> {
    let schema = definition.arrow_schema();

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(definition.fields.len() + 1);
    for field in definition.fields {
        columns.push(column(field, records)?);
    }
    columns.push(Arc::new(Int64Array::from(
        records.iter().map(|r| r.offset).collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).map_err(|e| {
        Error::Serialization(format!("Building record batch for {}: {e}", definition.name))
    })?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(writer_properties()))
        .map_err(|e| Error::Serialization(format!("parquet writer init failed: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| Error::Serialization(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| Error::Serialization(format!("parquet close failed: {e}")))?;
    Ok(Bytes::from(buffer))
}

fn column(field: &FieldSpec, records: &[TypedRecord]) -> Result<ArrayRef> {
    let values = records
        .iter()
        .map(|r| r.get(field.name).unwrap_or(&Value::Null));
    let mismatch = |value: &Value| {
        Error::Serialization(format!(
            "field '{}' declared {:?} holds {value:?}",
            field.name, field.field_type
        ))
    };

    let array: ArrayRef = match field.field_type {
        FieldType::String => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    Value::String(s) => Ok(Some(s.as_str())),
                    Value::Null => Ok(None),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        FieldType::Double => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    Value::Double(d) => Ok(Some(*d)),
                    Value::Null => Ok(None),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        FieldType::Integer => Arc::new(Int32Array::from(
            values
                .map(|v| match v {
                    Value::Integer(i) => Ok(Some(*i)),
                    Value::Null => Ok(None),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        FieldType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .map(|v| match v {
                        Value::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                        Value::Null => Ok(None),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
            .with_timezone(TIMESTAMP_TZ),
        ),
    };
    Ok(array)
}

/// Reads a part back, for assertions on what was persisted.
#[cfg(test)]
pub(crate) fn read(bytes: Bytes) -> Vec<RecordBatch> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    ParquetRecordBatchReaderBuilder::try_new(bytes)
        .unwrap()
        .build()
        .unwrap()
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap()
}

/// The `_offset` column of every row of a part.
#[cfg(test)]
pub(crate) fn read_offsets(bytes: Bytes) -> Vec<i64> {
    use arrow::array::AsArray;
    use arrow::datatypes::Int64Type;

    read(bytes)
        .iter()
        .flat_map(|batch| {
            batch
                .column_by_name(crate::schema::OFFSET_COLUMN)
                .unwrap()
                .as_primitive::<Int64Type>()
                .values()
                .to_vec()
        })
        .collect()
}
