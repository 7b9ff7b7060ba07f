//! Columnar part-file writer
//!
//! Every call writes one Parquet part file under a fresh UUID name, so
//! concurrent writers never collide and a crashed write can only leave an
//! unreferenced file behind.

mod run;

pub use run::*;

use crate::error::{Error, Result};
use crate::registry::{self, Entity, FileKind, TableSchema};
use crate::storage::Storage;
use crate::table::{conform_batch, rows_to_batch, Row};
use arrow::array::{Array, AsArray};
use arrow::datatypes::Int64Type;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const META_SCHEMA_VERSION: &str = "mediagraph.schema_version";
pub const META_ENTITY: &str = "mediagraph.entity";
pub const META_KIND: &str = "mediagraph.kind";

/// Where a batch is written and which declared schema it must satisfy
#[derive(Debug, Clone, Copy)]
pub struct Destination {
    pub entity: Entity,
    pub kind: FileKind,
    pub schema_version: u32,
    /// Declare every column nullable (compaction of partial manifests)
    pub relax_nulls: bool,
}

impl Destination {
    pub fn new(entity: Entity, kind: FileKind, schema_version: u32) -> Self {
        Self {
            entity,
            kind,
            schema_version,
            relax_nulls: false,
        }
    }

    /// Declared schema for this destination
    pub fn schema(&self) -> Result<TableSchema> {
        let schema = registry::schema_for(self.entity, self.kind, self.schema_version)?;
        Ok(if self.relax_nulls {
            schema.relaxed()
        } else {
            schema
        })
    }
}

/// Outcome of one part-file write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub uri: String,
    pub bytes: u64,
    pub row_count: u64,
    /// blake3 of the file contents, hex encoded
    pub checksum: String,
}

/// A part file read back from storage
#[derive(Debug, Clone)]
pub struct PartFile {
    pub uri: String,
    pub entity: Option<Entity>,
    pub kind: Option<FileKind>,
    /// Version recorded in the file footer, if any
    pub schema_version: Option<u32>,
    pub batch: RecordBatch,
}

impl PartFile {
    /// Footer version, falling back to the newest per-row version
    pub fn effective_version(&self) -> Option<u32> {
        self.schema_version.or_else(|| max_row_version(&self.batch))
    }
}

pub fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn max_row_version(batch: &RecordBatch) -> Option<u32> {
    let column = batch.column_by_name("schema_version")?;
    if column.data_type() != &arrow::datatypes::DataType::Int64 {
        return None;
    }
    column
        .as_primitive::<Int64Type>()
        .iter()
        .flatten()
        .max()
        .map(|v| v as u32)
}

fn check_row_versions(batch: &RecordBatch, dest: &Destination) -> Result<()> {
    let column = batch
        .column_by_name("schema_version")
        .ok_or_else(|| Error::Schema("Missing schema_version column".to_string()))?;
    for version in column.as_primitive::<Int64Type>().iter().flatten() {
        if version < 1 || version > dest.schema_version as i64 {
            return Err(Error::Schema(format!(
                "Row schema_version {} cannot be stored in a {} {} v{} file",
                version, dest.entity, dest.kind, dest.schema_version
            )));
        }
    }
    Ok(())
}

/// Serialize a batch as a Parquet file carrying the mediagraph footer keys
pub fn encode_parquet(batch: &RecordBatch, dest: &Destination) -> Result<Bytes> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(Some(vec![
            KeyValue::new(
                META_SCHEMA_VERSION.to_string(),
                dest.schema_version.to_string(),
            ),
            KeyValue::new(META_ENTITY.to_string(), dest.entity.as_str().to_string()),
            KeyValue::new(META_KIND.to_string(), dest.kind.as_str().to_string()),
        ]))
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(Bytes::from(buf))
}

/// Parse a Parquet part file
pub fn decode_parquet(uri: &str, data: Bytes) -> Result<PartFile> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data).map_err(|e| {
        Error::IncompatibleFile {
            uri: uri.to_string(),
            reason: e.to_string(),
        }
    })?;

    let footer: HashMap<String, String> = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| Some((kv.key.clone(), kv.value.clone()?)))
                .collect()
        })
        .unwrap_or_default();

    let schema = Arc::new(builder.schema().as_ref().clone().with_metadata(HashMap::new()));
    let reader = builder.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch?;
        batches.push(RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?);
    }
    let batch = arrow::compute::concat_batches(&schema, &batches)?;

    Ok(PartFile {
        uri: uri.to_string(),
        entity: footer.get(META_ENTITY).and_then(|e| e.parse().ok()),
        kind: footer.get(META_KIND).and_then(|k| k.parse().ok()),
        schema_version: footer
            .get(META_SCHEMA_VERSION)
            .and_then(|v| v.parse().ok()),
        batch,
    })
}

/// Writes part files into the canonical layout
#[derive(Debug, Clone)]
pub struct ColumnarWriter {
    storage: Storage,
}

impl ColumnarWriter {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validate rows against the declared schema and write them
    pub async fn write_rows(&self, rows: &[Row], dest: Destination) -> Result<WriteResult> {
        let batch = rows_to_batch(&dest.schema()?, rows)?;
        self.write(&batch, dest).await
    }

    /// Write one batch as a new part file.
    ///
    /// The batch is reordered to the declared column order; unknown columns,
    /// retyped columns, nulls in required columns and rows newer than the
    /// destination version are rejected before anything is written.
    pub async fn write(&self, batch: &RecordBatch, dest: Destination) -> Result<WriteResult> {
        if batch.num_rows() == 0 {
            return Err(Error::Validation(format!(
                "Refusing to write an empty {} {} part",
                dest.entity, dest.kind
            )));
        }

        let declared = dest.schema()?.to_arrow();
        let batch = conform_batch(batch, &declared)?;
        check_row_versions(&batch, &dest)?;

        let data = encode_parquet(&batch, &dest)?;
        let result = WriteResult {
            uri: registry::path_for(dest.entity, dest.kind, &Uuid::new_v4())?,
            bytes: data.len() as u64,
            row_count: batch.num_rows() as u64,
            checksum: checksum(&data),
        };

        self.storage.put(&result.uri, data).await?;
        debug!(
            uri = %result.uri,
            rows = result.row_count,
            bytes = result.bytes,
            "Wrote part file"
        );
        Ok(result)
    }

    /// Read a part file back
    pub async fn read(&self, uri: &str) -> Result<PartFile> {
        let data = self.storage.get(uri).await?;
        decode_parquet(uri, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{batch_to_rows, row, Value};

    pub(crate) fn doc_text_row(id: &str, text: &str) -> Row {
        row([
            ("id", Value::from(id)),
            ("schema_version", Value::Int(1)),
            ("text", Value::from(text)),
        ])
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let writer = ColumnarWriter::new(Storage::in_memory("v1"));
        let rows = vec![
            doc_text_row("a", "first chunk"),
            doc_text_row("b", "second chunk"),
        ];
        let dest = Destination::new(Entity::DocChunk, FileKind::Text, 1);

        let result = writer.write_rows(&rows, dest).await.unwrap();
        assert!(result.uri.starts_with("vertices/DocChunk/text/part-"));
        assert_eq!(result.row_count, 2);

        let stored = writer.storage().get(&result.uri).await.unwrap();
        assert_eq!(result.bytes, stored.len() as u64);
        assert_eq!(result.checksum, checksum(&stored));

        let part = writer.read(&result.uri).await.unwrap();
        assert_eq!(part.entity, Some(Entity::DocChunk));
        assert_eq!(part.kind, Some(FileKind::Text));
        assert_eq!(part.schema_version, Some(1));
        assert_eq!(batch_to_rows(&part.batch).unwrap(), rows);
    }

    #[tokio::test]
    async fn test_unique_part_names() {
        let writer = ColumnarWriter::new(Storage::in_memory("v1"));
        let dest = Destination::new(Entity::DocChunk, FileKind::Text, 1);
        let rows = vec![doc_text_row("a", "x")];
        let first = writer.write_rows(&rows, dest).await.unwrap();
        let second = writer.write_rows(&rows, dest).await.unwrap();
        assert_ne!(first.uri, second.uri);
    }

    #[tokio::test]
    async fn test_invalid_data_writes_nothing() {
        let storage = Storage::in_memory("v1");
        let writer = ColumnarWriter::new(storage.clone());
        let dest = Destination::new(Entity::DocChunk, FileKind::Text, 1);

        let mut unknown = doc_text_row("a", "x");
        unknown.insert("color".to_string(), Value::from("red"));
        assert!(writer.write_rows(&[unknown], dest).await.is_err());

        let mut too_new = doc_text_row("a", "x");
        too_new.insert("schema_version".to_string(), Value::Int(2));
        let err = writer.write_rows(&[too_new], dest).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert!(!err.is_retryable());

        assert!(storage.list("vertices").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relax_nulls() {
        let writer = ColumnarWriter::new(Storage::in_memory("v1"));
        let mut dest = Destination::new(Entity::DocChunk, FileKind::Text, 1);
        let missing_text = row([("id", Value::from("a")), ("schema_version", Value::Int(1))]);
        assert!(writer.write_rows(&[missing_text.clone()], dest).await.is_err());

        dest.relax_nulls = true;
        let result = writer.write_rows(&[missing_text], dest).await.unwrap();
        assert_eq!(result.row_count, 1);
    }
}
