//! Validation of stored part files against the registry

use super::{part_dir, schema_for, Entity, FileKind, TableSchema};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::writer::decode_parquet;
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome for one file
#[derive(Debug, Clone, Serialize)]
pub struct FileCheck {
    pub uri: String,
    pub schema_version: Option<u32>,
    pub rows: usize,
    /// `None` when the file is compatible
    pub problem: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub files: Vec<FileCheck>,
}

impl ValidationReport {
    pub fn incompatible(&self) -> impl Iterator<Item = &FileCheck> {
        self.files.iter().filter(|f| f.problem.is_some())
    }

    pub fn is_valid(&self) -> bool {
        self.incompatible().next().is_none()
    }

    /// Turn the first incompatible file into an error
    pub fn into_result(self) -> Result<Self> {
        if let Some(bad) = self.incompatible().next() {
            return Err(Error::IncompatibleFile {
                uri: bad.uri.clone(),
                reason: bad.problem.clone().unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

/// Check a file schema against the declared one.
///
/// Shared columns must agree on type; the file may omit nullable declared
/// columns and may carry additional nullable columns, nothing else.
pub fn check_compatible(declared: &TableSchema, actual: &TableSchema) -> std::result::Result<(), String> {
    for field in &actual.fields {
        match declared.field(&field.name) {
            Some(expected) if expected.field_type != field.field_type => {
                return Err(format!(
                    "column '{}' is {} but {} is declared",
                    field.name, field.field_type, expected.field_type
                ));
            }
            Some(_) => {}
            None if !field.nullable => {
                return Err(format!(
                    "undeclared column '{}' is not nullable",
                    field.name
                ));
            }
            None => {}
        }
    }

    for field in &declared.fields {
        if !field.nullable && actual.field(&field.name).is_none() {
            return Err(format!("required column '{}' is missing", field.name));
        }
    }
    Ok(())
}

/// Validate every part file stored for `entity`/`kind`
pub async fn validate_dir(
    storage: &Storage,
    entity: Entity,
    kind: FileKind,
) -> Result<ValidationReport> {
    let dir = part_dir(entity, kind)?;
    let mut report = ValidationReport::default();

    for object in storage.list(&dir).await? {
        if !object.key.ends_with(".parquet") {
            continue;
        }
        let data = storage.get(&object.key).await?;
        let check = match decode_parquet(&object.key, data) {
            Ok(part) => {
                let version = part.effective_version();
                let problem = match (part.entity, part.kind) {
                    (Some(e), _) if e != entity => {
                        Some(format!("footer names entity {}", e))
                    }
                    (_, Some(k)) if k != kind => Some(format!("footer names kind {}", k)),
                    _ => match version {
                        None => Some("no schema_version recorded".to_string()),
                        Some(v) => match schema_for(entity, kind, v) {
                            Err(e) => Some(e.to_string()),
                            Ok(declared) => TableSchema::from_arrow(&part.batch.schema())
                                .map_err(|e| e.to_string())
                                .and_then(|actual| check_compatible(&declared, &actual))
                                .err(),
                        },
                    },
                };
                FileCheck {
                    uri: object.key.clone(),
                    schema_version: version,
                    rows: part.batch.num_rows(),
                    problem,
                }
            }
            Err(e) => FileCheck {
                uri: object.key.clone(),
                schema_version: None,
                rows: 0,
                problem: Some(e.to_string()),
            },
        };

        match &check.problem {
            Some(problem) => warn!(uri = %check.uri, %problem, "Incompatible part file"),
            None => debug!(uri = %check.uri, "Part file is compatible"),
        }
        report.files.push(check);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldSpec, FieldType};
    use crate::table::{row, Value};
    use crate::writer::{encode_parquet, ColumnarWriter, Destination};
    use bytes::Bytes;

    #[test]
    fn test_subset_and_superset_are_compatible() {
        let v1 = schema_for(Entity::AudioClip, FileKind::Core, 1).unwrap();
        let v2 = schema_for(Entity::AudioClip, FileKind::Core, 2).unwrap();
        assert!(check_compatible(&v2, &v1).is_ok());
        assert!(check_compatible(&v1, &v2).is_ok());

        let mut retyped = v1.clone();
        retyped.fields[2].field_type = FieldType::Int64;
        assert!(check_compatible(&v1, &retyped).is_err());

        let mut extra = v1.clone();
        extra.fields.push(FieldSpec {
            name: "bitrate".to_string(),
            field_type: FieldType::Int64,
            nullable: false,
            since_version: 1,
        });
        assert!(check_compatible(&v1, &extra).is_err());
    }

    #[tokio::test]
    async fn test_validate_dir_reports_file_identity() {
        let storage = Storage::in_memory("v1");
        let writer = ColumnarWriter::new(storage.clone());
        let dest = Destination::new(Entity::DocChunk, FileKind::Text, 1);
        let good = writer
            .write_rows(
                &[row([
                    ("id", Value::from("a")),
                    ("schema_version", Value::Int(1)),
                    ("text", Value::from("ok")),
                ])],
                dest,
            )
            .await
            .unwrap();

        // a text part whose body column was written as an integer
        let bogus = TableSchema::new(vec![
            FieldSpec {
                name: "id".to_string(),
                field_type: FieldType::Utf8,
                nullable: false,
                since_version: 1,
            },
            FieldSpec {
                name: "schema_version".to_string(),
                field_type: FieldType::Int64,
                nullable: false,
                since_version: 1,
            },
            FieldSpec {
                name: "text".to_string(),
                field_type: FieldType::Int64,
                nullable: false,
                since_version: 1,
            },
        ]);
        let batch = crate::table::rows_to_batch(
            &bogus,
            &[row([
                ("id", Value::from("b")),
                ("schema_version", Value::Int(1)),
                ("text", Value::Int(7)),
            ])],
        )
        .unwrap();
        let bad_uri = "vertices/DocChunk/text/part-bad.parquet";
        storage
            .put(bad_uri, encode_parquet(&batch, &dest).unwrap())
            .await
            .unwrap();
        storage
            .put("vertices/DocChunk/text/part-junk.parquet", Bytes::from_static(b"nope"))
            .await
            .unwrap();

        let report = validate_dir(&storage, Entity::DocChunk, FileKind::Text)
            .await
            .unwrap();
        assert_eq!(report.files.len(), 3);
        let bad: Vec<&str> = report.incompatible().map(|f| f.uri.as_str()).collect();
        assert!(bad.contains(&bad_uri));
        assert!(bad.contains(&"vertices/DocChunk/text/part-junk.parquet"));
        assert!(!bad.contains(&good.uri.as_str()));

        match report.into_result() {
            Err(Error::IncompatibleFile { uri, .. }) => assert!(uri.contains("part-")),
            other => panic!("expected incompatible file, got {:?}", other.map(|r| r.files.len())),
        }
    }
}
