//! Parquet encoding of aggregate groups.

use std::sync::Arc;

use bytes::Bytes;
use deltalake::arrow::array::{
    ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use deltalake::arrow::record_batch::RecordBatch;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::Compression;
use deltalake::parquet::file::properties::WriterProperties;

use super::table::data_schema;
use crate::error::SinkError;
use crate::window::WindowAggregate;

/// Build a record batch of the data columns for `aggregates`.
pub fn to_record_batch(aggregates: &[&WindowAggregate]) -> Result<RecordBatch, SinkError> {
    let window_end = TimestampMicrosecondArray::from_iter_values(
        aggregates.iter().map(|a| a.window_end.timestamp_micros()),
    )
    .with_timezone("UTC");
    let source_id = StringArray::from_iter_values(aggregates.iter().map(|a| a.source_id.as_str()));
    let metric = StringArray::from_iter_values(aggregates.iter().map(|a| a.metric.as_str()));
    let metric_value: Float64Array = aggregates.iter().map(|a| a.metric_value).collect();
    let record_count = Int64Array::from_iter_values(
        aggregates
            .iter()
            .map(|a| i64::try_from(a.record_count).unwrap_or(i64::MAX)),
    );

    let columns: Vec<ArrayRef> = vec![
        Arc::new(window_end),
        Arc::new(source_id),
        Arc::new(metric),
        Arc::new(metric_value),
        Arc::new(record_count),
    ];
    RecordBatch::try_new(data_schema(), columns).map_err(|source| SinkError::RecordBatch { source })
}

/// Encode `aggregates` as a Snappy-compressed Parquet file.
pub fn encode(aggregates: &[&WindowAggregate]) -> Result<Bytes, SinkError> {
    let batch = to_record_batch(aggregates)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .map_err(|source| SinkError::Parquet { source })?;
    writer
        .write(&batch)
        .map_err(|source| SinkError::Parquet { source })?;
    writer
        .close()
        .map_err(|source| SinkError::Parquet { source })?;
    Ok(Bytes::from(buffer))
}
