use super::{ColumnarWriter, Destination};
use crate::error::{Error, Result};
use crate::manifest::{ManifestFile, ManifestInfo, ManifestMeta, ManifestStore};
use crate::registry::{Entity, FileKind};
use crate::storage::Storage;
use crate::table::{Row, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// All sub-table rows produced by one ingestion run of one entity
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub entity: Entity,
    pub schema_version: u32,
    pub pipeline_version: String,
    pub tables: BTreeMap<FileKind, Vec<Row>>,
}

impl RunBatch {
    pub fn new(entity: Entity, schema_version: u32, pipeline_version: &str) -> Self {
        Self {
            entity,
            schema_version,
            pipeline_version: pipeline_version.to_string(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with(mut self, kind: FileKind, rows: Vec<Row>) -> Self {
        self.tables.entry(kind).or_default().extend(rows);
        self
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Append another run of the same entity and version
    pub fn absorb(&mut self, other: RunBatch) {
        for (kind, rows) in other.tables {
            self.tables.entry(kind).or_default().extend(rows);
        }
    }
}

/// Ids of one sub-table; vertex sub-tables may not repeat an id
fn ids_of(entity: Entity, kind: FileKind, rows: &[Row]) -> Result<BTreeSet<&str>> {
    let ids = rows
        .iter()
        .map(|r| {
            r.get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Schema("Row is missing its id".to_string()))
        })
        .collect::<Result<BTreeSet<_>>>()?;
    if !entity.is_edge() && ids.len() != rows.len() {
        return Err(Error::Schema(format!(
            "{} {} rows contain duplicate ids",
            entity, kind
        )));
    }
    Ok(ids)
}

/// Writes a run's part files, then commits its manifest
#[derive(Debug, Clone)]
pub struct RunWriter {
    writer: ColumnarWriter,
    manifests: ManifestStore,
}

impl RunWriter {
    pub fn new(storage: Storage) -> Self {
        Self {
            writer: ColumnarWriter::new(storage.clone()),
            manifests: ManifestStore::new(storage),
        }
    }

    /// Check that the run carries exactly the entity's sub-tables and that
    /// they describe the same set of primary keys
    fn validate(run: &RunBatch) -> Result<()> {
        let required = run.entity.required_kinds();
        for kind in required {
            if run.tables.get(kind).map(Vec::is_empty).unwrap_or(true) {
                return Err(Error::MissingSubTable {
                    entity: run.entity.to_string(),
                    kind: kind.to_string(),
                    run_id: "(unwritten)".to_string(),
                });
            }
        }
        if let Some(extra) = run.tables.keys().find(|k| !required.contains(k)) {
            return Err(Error::Schema(format!(
                "{} has no {} sub-table",
                run.entity, extra
            )));
        }

        let mut kinds = run.tables.iter();
        let Some((first_kind, first_rows)) = kinds.next() else {
            return Ok(());
        };
        let expected = ids_of(run.entity, *first_kind, first_rows)?;
        for (kind, rows) in kinds {
            if ids_of(run.entity, *kind, rows)? != expected {
                return Err(Error::IncompleteEntity {
                    entity: run.entity.to_string(),
                    reason: format!(
                        "{} and {} sub-tables do not share the same ids",
                        first_kind, kind
                    ),
                });
            }
        }
        Ok(())
    }

    /// Write every sub-table and then the manifest that references them.
    ///
    /// If a part or the manifest fails to write, no manifest is committed
    /// and the parts already stored are removed.
    pub async fn write_run(&self, run: &RunBatch) -> Result<ManifestInfo> {
        Self::validate(run)?;

        let mut files = Vec::with_capacity(run.tables.len());
        let committed = match self.write_parts(run, &mut files).await {
            Ok(()) => {
                let info = ManifestInfo::build(
                    files.clone(),
                    ManifestMeta::ingest(run.entity, run.schema_version, &run.pipeline_version),
                );
                self.manifests.write(&info).await.map(|_| info)
            }
            Err(e) => Err(e),
        };
        let info = match committed {
            Ok(info) => info,
            Err(e) => {
                for file in &files {
                    if let Err(cleanup) = self.writer.storage().delete(&file.uri).await {
                        debug!(uri = %file.uri, error = %cleanup, "Could not remove partial run file");
                    }
                }
                return Err(e);
            }
        };
        info!(
            entity = %run.entity,
            rows = run.row_count(),
            run_id = %info.run_id,
            "Ingested run"
        );
        Ok(info)
    }

    async fn write_parts(&self, run: &RunBatch, files: &mut Vec<ManifestFile>) -> Result<()> {
        for (kind, rows) in &run.tables {
            let dest = Destination::new(run.entity, *kind, run.schema_version);
            let result = self.writer.write_rows(rows, dest).await?;
            files.push(ManifestFile::from_write(*kind, &result));
        }
        Ok(())
    }
}
