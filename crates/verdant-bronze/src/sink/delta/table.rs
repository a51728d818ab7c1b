//! Delta Lake table management for the aggregate table.

use std::collections::HashMap;
use std::sync::Arc;

use deltalake::DeltaTable;
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use deltalake::operations::create::CreateBuilder;
use object_store::path::Path;
use tracing::info;
use url::Url;

use verdant_core::storage::{BackendConfig, StorageProvider};

use crate::error::SinkError;

/// Columns the table is partitioned by, in directory order.
pub const PARTITION_COLUMNS: [&str; 2] = ["device_type", "window_start"];

/// Ensure Delta Lake cloud storage handlers are registered.
///
/// This is idempotent - calling multiple times is safe.
pub fn ensure_handlers_registered() {
    deltalake::aws::register_handlers(None);
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Columns stored in each data file. Partition columns live in the log only.
pub fn data_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("window_end", timestamp_type(), false),
        Field::new("source_id", DataType::Utf8, false),
        Field::new("metric", DataType::Utf8, false),
        Field::new("metric_value", DataType::Float64, true),
        Field::new("record_count", DataType::Int64, false),
    ]))
}

/// Full table schema: data columns followed by partition columns.
pub fn table_schema() -> Schema {
    let data = data_schema();
    let mut fields: Vec<Field> = data.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new("device_type", DataType::Utf8, false));
    fields.push(Field::new("window_start", timestamp_type(), false));
    Schema::new(fields)
}

/// Convert an Arrow schema to a Delta schema.
pub fn arrow_schema_to_delta(schema: &Schema) -> Result<deltalake::kernel::StructType, SinkError> {
    use deltalake::kernel::engine::arrow_conversion::TryIntoKernel;
    use deltalake::kernel::{DataType as DeltaType, StructField, StructType};

    let fields: Vec<StructField> = schema
        .fields()
        .iter()
        .map(|field| {
            let delta_type: DeltaType = field
                .data_type()
                .try_into_kernel()
                .map_err(|source| SinkError::SchemaConversion { source })?;
            Ok(StructField::new(
                field.name(),
                delta_type,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, SinkError>>()?;

    StructType::try_new(fields).map_err(|e| SinkError::StructType {
        message: e.to_string(),
    })
}

/// Construct the Delta table URL from a storage provider.
pub fn build_table_url(storage: &StorageProvider) -> Result<String, SinkError> {
    let root = Path::from("");
    match storage.config() {
        BackendConfig::S3(s3) => Ok(format!("s3://{}/{}", s3.bucket, storage.qualify_path(&root))),
        BackendConfig::Local(local) => Ok(format!("file://{}", local.path)),
        BackendConfig::Memory(_) => Err(SinkError::UnsupportedUri {
            uri: storage.canonical_url().to_string(),
        }),
    }
}

/// Storage options handed to Delta Lake, with the S3 endpoint of the
/// storage provider filled in when the user did not set one.
fn delta_storage_options(storage: &StorageProvider) -> HashMap<String, String> {
    let mut options = storage.storage_options().clone();
    if let BackendConfig::S3(s3) = storage.config()
        && let Some(endpoint) = &s3.endpoint
    {
        options
            .entry("AWS_ENDPOINT_URL".to_string())
            .or_insert_with(|| endpoint.clone());
        if endpoint.starts_with("http://") {
            options
                .entry("AWS_ALLOW_HTTP".to_string())
                .or_insert_with(|| "true".to_string());
        }
    }
    options
}

/// Load or create the aggregate table.
pub async fn load_or_create_table(
    storage: &StorageProvider,
    table_name: &str,
) -> Result<DeltaTable, SinkError> {
    let table_url = build_table_url(storage)?;
    let parsed_url = Url::parse(&table_url).map_err(|_| SinkError::UrlParse {
        url: table_url.clone(),
    })?;
    let options = delta_storage_options(storage);

    match deltalake::open_table_with_storage_options(parsed_url, options.clone()).await {
        Ok(table) => {
            info!(
                target = %table_name,
                "Loaded existing Delta table at version {}",
                table.version().unwrap_or(-1)
            );
            Ok(table)
        }
        Err(_) => {
            info!(target = %table_name, "Creating new Delta table at {}", table_url);

            let delta_schema = arrow_schema_to_delta(&table_schema())?;
            let table = CreateBuilder::new()
                .with_location(&table_url)
                .with_columns(delta_schema.fields().cloned())
                .with_partition_columns(PARTITION_COLUMNS)
                .with_storage_options(options)
                .await
                .map_err(|source| SinkError::DeltaOperation { source })?;

            Ok(table)
        }
    }
}
