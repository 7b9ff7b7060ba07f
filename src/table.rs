//! Row-level view of Arrow record batches
//!
//! Ingestion hands rows to the writer as [`Row`] maps; readers use
//! [`batch_to_rows`] when they need to join sub-tables by primary key.

use crate::error::{Error, Result};
use crate::registry::{FieldType, TableSchema};
use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, BooleanArray, FixedSizeListArray, Float32Array,
    Float64Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Float32Type, Float64Type, Int64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Vector(Vec<f32>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row keyed by column name
pub type Row = BTreeMap<String, Value>;

/// Build a row from `(column, value)` pairs
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn mismatch(column: &str, expected: &str, got: &Value) -> Error {
    Error::Schema(format!(
        "Column '{}' expects {}, got {:?}",
        column, expected, got
    ))
}

fn build_column(spec: &crate::registry::FieldSpec, rows: &[Row]) -> Result<ArrayRef> {
    let name = spec.name.as_str();
    let cells = rows.iter().map(|r| r.get(name).unwrap_or(&Value::Null));

    for (i, cell) in rows.iter().map(|r| r.get(name)).enumerate() {
        if !spec.nullable && cell.map(Value::is_null).unwrap_or(true) {
            return Err(Error::Schema(format!(
                "Column '{}' is required but row {} has no value",
                name, i
            )));
        }
    }

    let array: ArrayRef = match spec.field_type {
        FieldType::Utf8 => Arc::new(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Text(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(name, "utf8", other)),
                })
                .collect::<Result<StringArray>>()?,
        ),
        FieldType::Int64 => Arc::new(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Int(i) => Ok(Some(*i)),
                    other => Err(mismatch(name, "int64", other)),
                })
                .collect::<Result<Int64Array>>()?,
        ),
        FieldType::Float64 => Arc::new(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Float(f) => Ok(Some(*f)),
                    Value::Int(i) => Ok(Some(*i as f64)),
                    other => Err(mismatch(name, "float64", other)),
                })
                .collect::<Result<Float64Array>>()?,
        ),
        FieldType::Boolean => Arc::new(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Bool(b) => Ok(Some(*b)),
                    other => Err(mismatch(name, "boolean", other)),
                })
                .collect::<Result<BooleanArray>>()?,
        ),
        FieldType::Vector(dim) => {
            let mut values: Vec<f32> = Vec::with_capacity(rows.len() * dim);
            let mut validity: Vec<bool> = Vec::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    Value::Null => {
                        values.extend(std::iter::repeat(0.0).take(dim));
                        validity.push(false);
                    }
                    Value::Vector(v) if v.len() == dim => {
                        values.extend_from_slice(v);
                        validity.push(true);
                    }
                    Value::Vector(v) => {
                        return Err(Error::InvalidVector(format!(
                            "Column '{}' expects {} dimensions, got {}",
                            name,
                            dim,
                            v.len()
                        )))
                    }
                    other => return Err(mismatch(name, "vector", other)),
                }
            }
            let item = Arc::new(Field::new("item", DataType::Float32, true));
            let nulls = if validity.iter().all(|v| *v) {
                None
            } else {
                Some(validity.into())
            };
            Arc::new(FixedSizeListArray::try_new(
                item,
                dim as i32,
                Arc::new(Float32Array::from(values)),
                nulls,
            )?)
        }
    };
    Ok(array)
}

/// Convert rows into a batch laid out exactly as `schema`.
///
/// Columns in a row that the schema does not declare are rejected.
pub fn rows_to_batch(schema: &TableSchema, rows: &[Row]) -> Result<RecordBatch> {
    for row in rows {
        if let Some(unknown) = row.keys().find(|k| schema.field(k).is_none()) {
            return Err(Error::Schema(format!("Unknown column '{}'", unknown)));
        }
    }

    let columns = schema
        .fields
        .iter()
        .map(|spec| build_column(spec, rows))
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

fn cell(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(index).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(index).to_string()),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(index)),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(index)),
        DataType::Boolean => Value::Bool(array.as_boolean().value(index)),
        DataType::FixedSizeList(_, _) => {
            let list = array.as_fixed_size_list().value(index);
            Value::Vector(list.as_primitive::<Float32Type>().values().to_vec())
        }
        other => {
            return Err(Error::Schema(format!(
                "Unsupported column type {}",
                other
            )))
        }
    };
    Ok(value)
}

/// Convert a batch back into rows; null cells are kept as [`Value::Null`]
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let schema = batch.schema();
    let mut rows = vec![Row::new(); batch.num_rows()];
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        for (i, row) in rows.iter_mut().enumerate() {
            row.insert(field.name().clone(), cell(column.as_ref(), i)?);
        }
    }
    Ok(rows)
}

/// Reorder and widen `batch` to `target`: missing columns become nulls and
/// columns the target does not know are rejected.
pub fn conform_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let source = batch.schema();
    for field in source.fields() {
        if target.field_with_name(field.name()).is_err() {
            return Err(Error::Schema(format!(
                "Column '{}' is not part of the target schema",
                field.name()
            )));
        }
    }

    let columns = target
        .fields()
        .iter()
        .map(|field| match source.index_of(field.name()) {
            Ok(idx) => {
                let column = batch.column(idx).clone();
                if column.data_type() != field.data_type() {
                    return Err(Error::Schema(format!(
                        "Column '{}' has type {} but {} is expected",
                        field.name(),
                        column.data_type(),
                        field.data_type()
                    )));
                }
                Ok(column)
            }
            Err(_) => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

/// Concatenate batches that share one schema
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    Ok(arrow::compute::concat_batches(schema, batches)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{schema_for, Entity, FileKind};

    fn audio_row(id: &str, channels: Option<i64>) -> Row {
        let mut r = row([
            ("id", Value::from(id)),
            ("schema_version", Value::Int(2)),
            ("media_asset_id", Value::from("m1")),
            ("start_ms", Value::Int(0)),
            ("end_ms", Value::Int(1000)),
            ("sample_rate", Value::Int(16_000)),
            ("pipeline_version", Value::from("p1")),
            ("created_at", Value::from("2026-01-01T00:00:00Z")),
        ]);
        r.insert("channels".to_string(), channels.into());
        r
    }

    #[test]
    fn test_rows_round_trip() {
        let schema = schema_for(Entity::AudioClip, FileKind::Core, 2).unwrap();
        let rows = vec![audio_row("a", Some(2)), audio_row("b", None)];
        let batch = rows_to_batch(&schema, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(0).name(), "id");
        assert_eq!(batch_to_rows(&batch).unwrap(), rows);
    }

    #[test]
    fn test_required_column_missing() {
        let schema = schema_for(Entity::AudioClip, FileKind::Core, 2).unwrap();
        let mut bad = audio_row("a", None);
        bad.remove("sample_rate");
        assert!(matches!(
            rows_to_batch(&schema, &[bad]),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_vector_dimension_checked() {
        let schema = schema_for(Entity::AudioClip, FileKind::Vector, 1).unwrap();
        let ok = row([
            ("id", Value::from("a")),
            ("schema_version", Value::Int(1)),
            ("embedding", Value::Vector(vec![0.5; 512])),
        ]);
        let short = row([
            ("id", Value::from("b")),
            ("schema_version", Value::Int(1)),
            ("embedding", Value::Vector(vec![0.5; 3])),
        ]);
        let batch = rows_to_batch(&schema, &[ok.clone()]).unwrap();
        assert_eq!(batch_to_rows(&batch).unwrap(), vec![ok]);
        assert!(matches!(
            rows_to_batch(&schema, &[short]),
            Err(Error::InvalidVector(_))
        ));
    }

    #[test]
    fn test_conform_fills_nulls() {
        let v1 = schema_for(Entity::AudioClip, FileKind::Core, 1).unwrap();
        let v2 = schema_for(Entity::AudioClip, FileKind::Core, 2).unwrap();
        let mut r = audio_row("a", None);
        r.remove("channels");
        r.insert("schema_version".to_string(), Value::Int(1));
        let batch = rows_to_batch(&v1, &[r]).unwrap();

        let widened = conform_batch(&batch, &v2.to_arrow()).unwrap();
        assert_eq!(widened.num_columns(), v2.fields.len());
        let rows = batch_to_rows(&widened).unwrap();
        assert_eq!(rows[0]["channels"], Value::Null);
        assert_eq!(rows[0]["schema_version"], Value::Int(1));

        assert!(conform_batch(&widened, &v1.to_arrow()).is_err());
    }
}
