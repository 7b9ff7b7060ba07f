//! Path and schema registry
//!
//! Declares, for every entity and sub-table kind, the ordered and versioned
//! field list that part files must carry. Schema evolution is additive only:
//! a field introduced at version N is present for every version >= N and is
//! always nullable when N > 1.

pub mod paths;
pub mod validate;

pub use paths::*;

use crate::error::{Error, Result};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Vector length used by text embeddings (documents, transcripts)
pub const TEXT_EMBEDDING_DIM: usize = 384;

/// Vector length used by image and audio embeddings
pub const MEDIA_EMBEDDING_DIM: usize = 512;

/// Vertex and edge types known to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    MediaAsset,
    DocChunk,
    Transcript,
    ImageAsset,
    AudioClip,
    DerivedFrom,
    NextKeyframe,
    NextTranscript,
}

impl Entity {
    pub const ALL: [Entity; 8] = [
        Entity::MediaAsset,
        Entity::DocChunk,
        Entity::Transcript,
        Entity::ImageAsset,
        Entity::AudioClip,
        Entity::DerivedFrom,
        Entity::NextKeyframe,
        Entity::NextTranscript,
    ];

    pub const VERTICES: [Entity; 5] = [
        Entity::MediaAsset,
        Entity::DocChunk,
        Entity::Transcript,
        Entity::ImageAsset,
        Entity::AudioClip,
    ];

    pub const EDGES: [Entity; 3] = [
        Entity::DerivedFrom,
        Entity::NextKeyframe,
        Entity::NextTranscript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::MediaAsset => "MediaAsset",
            Entity::DocChunk => "DocChunk",
            Entity::Transcript => "Transcript",
            Entity::ImageAsset => "ImageAsset",
            Entity::AudioClip => "AudioClip",
            Entity::DerivedFrom => "DerivedFrom",
            Entity::NextKeyframe => "NextKeyframe",
            Entity::NextTranscript => "NextTranscript",
        }
    }

    /// SQL table name used inside snapshots
    pub fn table_name(&self) -> &'static str {
        match self {
            Entity::MediaAsset => "media_asset",
            Entity::DocChunk => "doc_chunk",
            Entity::Transcript => "transcript",
            Entity::ImageAsset => "image_asset",
            Entity::AudioClip => "audio_clip",
            Entity::DerivedFrom => "derived_from",
            Entity::NextKeyframe => "next_keyframe",
            Entity::NextTranscript => "next_transcript",
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(
            self,
            Entity::DerivedFrom | Entity::NextKeyframe | Entity::NextTranscript
        )
    }

    /// Sub-tables every run of this entity must produce
    pub fn required_kinds(&self) -> &'static [FileKind] {
        match self {
            Entity::MediaAsset => &[FileKind::Core],
            Entity::DocChunk | Entity::Transcript | Entity::ImageAsset => {
                &[FileKind::Core, FileKind::Text, FileKind::Vector]
            }
            Entity::AudioClip => &[FileKind::Core, FileKind::Vector],
            Entity::DerivedFrom | Entity::NextKeyframe | Entity::NextTranscript => {
                &[FileKind::AdjList]
            }
        }
    }

    pub fn has_kind(&self, kind: FileKind) -> bool {
        self.required_kinds().contains(&kind)
    }

    /// Newest schema version registered for this entity
    pub fn latest_version(&self) -> u32 {
        match self {
            Entity::MediaAsset | Entity::AudioClip => 2,
            _ => 1,
        }
    }

    /// Embedding space of the vector sub-table, if any
    pub fn embedding_space(&self) -> Option<EmbeddingSpace> {
        match self {
            Entity::DocChunk | Entity::Transcript => Some(EmbeddingSpace::Text),
            Entity::ImageAsset => Some(EmbeddingSpace::Image),
            Entity::AudioClip => Some(EmbeddingSpace::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Entity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Entity::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s) || e.table_name() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown entity: {}", s)))
    }
}

/// Physical sub-table kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Core,
    Text,
    Vector,
    AdjList,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Core => "core",
            FileKind::Text => "text",
            FileKind::Vector => "vector",
            FileKind::AdjList => "adj_list",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(FileKind::Core),
            "text" => Ok(FileKind::Text),
            "vector" => Ok(FileKind::Vector),
            "adj_list" => Ok(FileKind::AdjList),
            other => Err(Error::Validation(format!("Unknown file kind: {}", other))),
        }
    }
}

/// Which query embeddings a vector column can be compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSpace {
    Text,
    Image,
    Audio,
}

impl EmbeddingSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSpace::Text => "text",
            EmbeddingSpace::Image => "image",
            EmbeddingSpace::Audio => "audio",
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            EmbeddingSpace::Text => TEXT_EMBEDDING_DIM,
            EmbeddingSpace::Image | EmbeddingSpace::Audio => MEDIA_EMBEDDING_DIM,
        }
    }
}

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Utf8,
    Int64,
    Float64,
    Boolean,
    /// Fixed-length f32 vector
    Vector(usize),
}

impl FieldType {
    pub fn to_arrow(&self) -> DataType {
        match self {
            FieldType::Utf8 => DataType::Utf8,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float64 => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
            FieldType::Vector(dim) => DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                *dim as i32,
            ),
        }
    }

    pub fn from_arrow(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Utf8 | DataType::LargeUtf8 => Ok(FieldType::Utf8),
            DataType::Int64 => Ok(FieldType::Int64),
            DataType::Float64 => Ok(FieldType::Float64),
            DataType::Boolean => Ok(FieldType::Boolean),
            DataType::FixedSizeList(item, len) if item.data_type() == &DataType::Float32 => {
                Ok(FieldType::Vector(*len as usize))
            }
            other => Err(Error::Schema(format!("Unsupported column type {}", other))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Utf8 => write!(f, "utf8"),
            FieldType::Int64 => write!(f, "int64"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Vector(dim) => write!(f, "vector[{}]", dim),
        }
    }
}

/// One column of a sub-table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub since_version: u32,
}

impl FieldSpec {
    pub fn vector_len(&self) -> Option<usize> {
        match self.field_type {
            FieldType::Vector(dim) => Some(dim),
            _ => None,
        }
    }
}

/// Ordered field list of one sub-table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSpec>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Copy of this schema with every column nullable
    pub fn relaxed(&self) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .cloned()
                .map(|mut f| {
                    f.nullable = true;
                    f
                })
                .collect(),
        }
    }

    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.fields
                .iter()
                .map(|f| Field::new(f.name.as_str(), f.field_type.to_arrow(), f.nullable))
                .collect::<Vec<_>>(),
        ))
    }

    /// Read a schema back from an arrow schema; version information is not
    /// recoverable and is reported as 1.
    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(FieldSpec {
                    name: f.name().clone(),
                    field_type: FieldType::from_arrow(f.data_type())?,
                    nullable: f.is_nullable(),
                    since_version: 1,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }
}

type FieldDef = (&'static str, FieldType, bool, u32);

const KEY_FIELDS: [FieldDef; 2] = [
    ("id", FieldType::Utf8, false, 1),
    ("schema_version", FieldType::Int64, false, 1),
];

const PROVENANCE_FIELDS: [FieldDef; 2] = [
    ("pipeline_version", FieldType::Utf8, false, 1),
    ("created_at", FieldType::Utf8, false, 1),
];

const MEDIA_ASSET_CORE: &[FieldDef] = &[
    ("uri", FieldType::Utf8, false, 1),
    ("media_type", FieldType::Utf8, false, 1),
    ("content_type", FieldType::Utf8, false, 1),
    ("size_bytes", FieldType::Int64, false, 1),
    ("checksum", FieldType::Utf8, false, 1),
    ("duration_ms", FieldType::Int64, true, 1),
];

const MEDIA_ASSET_SCOPE: &[FieldDef] = &[
    ("tenant_id", FieldType::Utf8, true, 2),
    ("org_id", FieldType::Utf8, true, 2),
    ("site_id", FieldType::Utf8, true, 2),
    ("stream_id", FieldType::Utf8, true, 2),
];

const DOC_CHUNK_CORE: &[FieldDef] = &[
    ("media_asset_id", FieldType::Utf8, false, 1),
    ("chunk_index", FieldType::Int64, false, 1),
    ("page", FieldType::Int64, true, 1),
    ("char_start", FieldType::Int64, false, 1),
    ("char_end", FieldType::Int64, false, 1),
];

const TRANSCRIPT_CORE: &[FieldDef] = &[
    ("media_asset_id", FieldType::Utf8, false, 1),
    ("segment_index", FieldType::Int64, false, 1),
    ("start_ms", FieldType::Int64, false, 1),
    ("end_ms", FieldType::Int64, false, 1),
    ("speaker", FieldType::Utf8, true, 1),
    ("language", FieldType::Utf8, true, 1),
];

const IMAGE_ASSET_CORE: &[FieldDef] = &[
    ("media_asset_id", FieldType::Utf8, false, 1),
    ("frame_index", FieldType::Int64, true, 1),
    ("timestamp_ms", FieldType::Int64, true, 1),
    ("width", FieldType::Int64, false, 1),
    ("height", FieldType::Int64, false, 1),
];

const AUDIO_CLIP_CORE: &[FieldDef] = &[
    ("media_asset_id", FieldType::Utf8, false, 1),
    ("start_ms", FieldType::Int64, false, 1),
    ("end_ms", FieldType::Int64, false, 1),
    ("sample_rate", FieldType::Int64, false, 1),
];

const AUDIO_CLIP_CHANNELS: &[FieldDef] = &[("channels", FieldType::Int64, true, 2)];

const TEXT_BODY: &[FieldDef] = &[("text", FieldType::Utf8, false, 1)];

const IMAGE_CAPTION: &[FieldDef] = &[("caption", FieldType::Utf8, true, 1)];

const EDGE_FIELDS: &[FieldDef] = &[
    ("src_id", FieldType::Utf8, false, 1),
    ("dst_id", FieldType::Utf8, false, 1),
];

fn field_defs(entity: Entity, kind: FileKind) -> Option<Vec<FieldDef>> {
    let mut defs: Vec<FieldDef> = KEY_FIELDS.to_vec();
    match (entity, kind) {
        (Entity::MediaAsset, FileKind::Core) => {
            defs.extend_from_slice(MEDIA_ASSET_CORE);
            defs.extend_from_slice(&PROVENANCE_FIELDS);
            defs.extend_from_slice(MEDIA_ASSET_SCOPE);
        }
        (Entity::DocChunk, FileKind::Core) => {
            defs.extend_from_slice(DOC_CHUNK_CORE);
            defs.extend_from_slice(&PROVENANCE_FIELDS);
        }
        (Entity::Transcript, FileKind::Core) => {
            defs.extend_from_slice(TRANSCRIPT_CORE);
            defs.extend_from_slice(&PROVENANCE_FIELDS);
        }
        (Entity::ImageAsset, FileKind::Core) => {
            defs.extend_from_slice(IMAGE_ASSET_CORE);
            defs.extend_from_slice(&PROVENANCE_FIELDS);
        }
        (Entity::AudioClip, FileKind::Core) => {
            defs.extend_from_slice(AUDIO_CLIP_CORE);
            defs.extend_from_slice(&PROVENANCE_FIELDS);
            defs.extend_from_slice(AUDIO_CLIP_CHANNELS);
        }
        (Entity::DocChunk | Entity::Transcript, FileKind::Text) => {
            defs.extend_from_slice(TEXT_BODY);
        }
        (Entity::ImageAsset, FileKind::Text) => defs.extend_from_slice(IMAGE_CAPTION),
        (Entity::DocChunk | Entity::Transcript | Entity::ImageAsset | Entity::AudioClip, FileKind::Vector) => {
            let dim = entity.embedding_space()?.dimension();
            defs.push(("embedding", FieldType::Vector(dim), false, 1));
        }
        (e, FileKind::AdjList) if e.is_edge() => {
            defs.extend_from_slice(EDGE_FIELDS);
        }
        _ => return None,
    }
    Some(defs)
}

/// Ordered field list of `entity`/`kind` at `schema_version`
pub fn schema_for(entity: Entity, kind: FileKind, schema_version: u32) -> Result<TableSchema> {
    if schema_version == 0 || schema_version > entity.latest_version() {
        return Err(Error::Schema(format!(
            "{} has no schema version {} (latest is {})",
            entity,
            schema_version,
            entity.latest_version()
        )));
    }

    let defs = field_defs(entity, kind).ok_or_else(|| {
        Error::Schema(format!("{} has no {} sub-table", entity, kind))
    })?;

    Ok(TableSchema::new(
        defs.into_iter()
            .filter(|(_, _, _, since)| *since <= schema_version)
            .map(|(name, field_type, nullable, since_version)| FieldSpec {
                name: name.to_string(),
                field_type,
                nullable,
                since_version,
            })
            .collect(),
    ))
}

/// Newest registered schema of `entity`/`kind`
pub fn latest_schema(entity: Entity, kind: FileKind) -> Result<TableSchema> {
    schema_for(entity, kind, entity.latest_version())
}

/// Union of several schemas by column name.
///
/// A column is nullable in the result if it is nullable in, or absent from,
/// any input. Columns are ordered by the earliest version that declares them,
/// then by name, so neither input order nor grouping changes the result.
/// Two inputs declaring the same column with different types is an error.
pub fn merge_schemas(schemas: &[TableSchema]) -> Result<TableSchema> {
    struct Merged {
        spec: FieldSpec,
        seen_in: usize,
    }

    let mut merged: HashMap<String, Merged> = HashMap::new();

    for schema in schemas {
        for field in &schema.fields {
            match merged.get_mut(&field.name) {
                Some(existing) => {
                    if existing.spec.field_type != field.field_type {
                        return Err(Error::Schema(format!(
                            "Column '{}' declared as both {} and {}",
                            field.name, existing.spec.field_type, field.field_type
                        )));
                    }
                    existing.spec.nullable |= field.nullable;
                    existing.spec.since_version =
                        existing.spec.since_version.min(field.since_version);
                    existing.seen_in += 1;
                }
                None => {
                    merged.insert(
                        field.name.clone(),
                        Merged {
                            spec: field.clone(),
                            seen_in: 1,
                        },
                    );
                }
            }
        }
    }

    let mut fields: Vec<Merged> = merged.into_values().collect();
    fields.sort_by(|a, b| {
        a.spec
            .since_version
            .cmp(&b.spec.since_version)
            .then_with(|| a.spec.name.cmp(&b.spec.name))
    });

    Ok(TableSchema::new(
        fields
            .into_iter()
            .map(|mut m| {
                if m.seen_in < schemas.len() {
                    m.spec.nullable = true;
                }
                m.spec
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(schema: &TableSchema) -> Vec<&str> {
        schema.names().collect()
    }

    #[test]
    fn test_schema_for_versions() {
        let v1 = schema_for(Entity::AudioClip, FileKind::Core, 1).unwrap();
        let v2 = schema_for(Entity::AudioClip, FileKind::Core, 2).unwrap();
        assert!(v1.field("channels").is_none());
        let channels = v2.field("channels").unwrap();
        assert!(channels.nullable);
        assert_eq!(channels.since_version, 2);
        assert_eq!(names(&v1)[..2], ["id", "schema_version"]);

        assert!(schema_for(Entity::AudioClip, FileKind::Core, 3).is_err());
        assert!(schema_for(Entity::AudioClip, FileKind::Text, 1).is_err());
        assert!(schema_for(Entity::DocChunk, FileKind::AdjList, 1).is_err());
    }

    #[test]
    fn test_vector_dimensions() {
        let doc = schema_for(Entity::DocChunk, FileKind::Vector, 1).unwrap();
        let image = schema_for(Entity::ImageAsset, FileKind::Vector, 1).unwrap();
        assert_eq!(doc.field("embedding").unwrap().vector_len(), Some(384));
        assert_eq!(image.field("embedding").unwrap().vector_len(), Some(512));
    }

    #[test]
    fn test_arrow_round_trip() {
        let schema = schema_for(Entity::ImageAsset, FileKind::Vector, 1).unwrap();
        let arrow = schema.to_arrow();
        let back = TableSchema::from_arrow(&arrow).unwrap();
        assert_eq!(names(&back), names(&schema));
        assert_eq!(back.field("embedding").unwrap().field_type, FieldType::Vector(512));
    }

    fn custom(fields: &[(&str, FieldType, bool)], version: u32) -> TableSchema {
        TableSchema::new(
            fields
                .iter()
                .map(|(name, ty, nullable)| FieldSpec {
                    name: name.to_string(),
                    field_type: *ty,
                    nullable: *nullable,
                    since_version: version,
                })
                .collect(),
        )
    }

    #[test]
    fn test_merge_fills_nullable_gaps() {
        let v1 = schema_for(Entity::MediaAsset, FileKind::Core, 1).unwrap();
        let v2 = schema_for(Entity::MediaAsset, FileKind::Core, 2).unwrap();
        let merged = merge_schemas(&[v1.clone(), v2.clone()]).unwrap();
        assert_eq!(merged.fields.len(), v2.fields.len());
        assert!(merged.field("tenant_id").unwrap().nullable);
        assert!(!merged.field("uri").unwrap().nullable);

        let a = custom(&[("id", FieldType::Utf8, false), ("x", FieldType::Int64, false)], 1);
        let b = custom(&[("id", FieldType::Utf8, false)], 1);
        let merged = merge_schemas(&[a, b]).unwrap();
        assert!(merged.field("x").unwrap().nullable);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let v1 = custom(
            &[
                ("id", FieldType::Utf8, false),
                ("a", FieldType::Int64, false),
            ],
            1,
        );
        let v2 = custom(
            &[
                ("id", FieldType::Utf8, false),
                ("a", FieldType::Int64, false),
                ("b", FieldType::Utf8, true),
            ],
            2,
        );
        let v3 = custom(
            &[
                ("id", FieldType::Utf8, false),
                ("c", FieldType::Float64, true),
                ("a", FieldType::Int64, true),
            ],
            3,
        );

        let expected = merge_schemas(&[v1.clone(), v2.clone(), v3.clone()]).unwrap();
        let permutations = [
            vec![v1.clone(), v3.clone(), v2.clone()],
            vec![v2.clone(), v1.clone(), v3.clone()],
            vec![v2.clone(), v3.clone(), v1.clone()],
            vec![v3.clone(), v1.clone(), v2.clone()],
            vec![v3.clone(), v2.clone(), v1.clone()],
        ];
        for inputs in permutations {
            assert_eq!(merge_schemas(&inputs).unwrap(), expected);
        }

        // associativity: ((v1 ∪ v2) ∪ v3) == (v1 ∪ (v2 ∪ v3))
        let left = merge_schemas(&[merge_schemas(&[v1.clone(), v2.clone()]).unwrap(), v3.clone()])
            .unwrap();
        let right =
            merge_schemas(&[v1.clone(), merge_schemas(&[v2.clone(), v3.clone()]).unwrap()])
                .unwrap();
        assert_eq!(left, expected);
        assert_eq!(right, expected);
    }

    #[test]
    fn test_merge_grouping_keeps_column_order() {
        let v1 = custom(&[("a", FieldType::Utf8, false), ("x", FieldType::Int64, false)], 1);
        let v2 = custom(&[("b", FieldType::Utf8, false), ("y", FieldType::Int64, false)], 2);
        let v3 = custom(&[("c", FieldType::Utf8, false), ("z", FieldType::Int64, false)], 3);

        let all = merge_schemas(&[v1.clone(), v2.clone(), v3.clone()]).unwrap();
        assert_eq!(names(&all), ["a", "x", "b", "y", "c", "z"]);

        let pairwise = merge_schemas(&[merge_schemas(&[v1.clone(), v2.clone()]).unwrap(), v3.clone()])
            .unwrap();
        assert_eq!(pairwise, all);
        let nested = merge_schemas(&[v1, merge_schemas(&[v2, v3]).unwrap()]).unwrap();
        assert_eq!(nested, all);
        assert!(all.fields.iter().all(|f| f.nullable));
    }

    #[test]
    fn test_merge_rejects_retyped_column() {
        let a = custom(&[("id", FieldType::Utf8, false), ("n", FieldType::Int64, false)], 1);
        let b = custom(&[("id", FieldType::Utf8, false), ("n", FieldType::Utf8, false)], 2);
        let err = merge_schemas(&[a, b]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_entity_parsing() {
        assert_eq!("DocChunk".parse::<Entity>().unwrap(), Entity::DocChunk);
        assert_eq!("audio_clip".parse::<Entity>().unwrap(), Entity::AudioClip);
        assert!("Podcast".parse::<Entity>().is_err());
        assert_eq!("adj_list".parse::<FileKind>().unwrap(), FileKind::AdjList);
    }
}
