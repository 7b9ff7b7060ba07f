//! Row builders shared by unit tests

use crate::registry::{Entity, FileKind, MEDIA_EMBEDDING_DIM, TEXT_EMBEDDING_DIM};
use crate::table::{row, Row, Value};
use crate::writer::RunBatch;
use async_trait::async_trait;

pub const CREATED_AT: &str = "2026-03-01T12:00:00Z";

/// A vector of `dim` dimensions pointing mostly along axis `hot`
pub fn axis_vector(dim: usize, hot: usize) -> Vec<f32> {
    let mut v = vec![0.01; dim];
    v[hot % dim] = 1.0;
    v
}

pub fn text_vector(hot: usize) -> Vec<f32> {
    axis_vector(TEXT_EMBEDDING_DIM, hot)
}

pub fn media_vector(hot: usize) -> Vec<f32> {
    axis_vector(MEDIA_EMBEDDING_DIM, hot)
}

pub fn media_asset(id: &str, media_type: &str, tenant: Option<&str>) -> Row {
    let mut r = row([
        ("id", Value::from(id)),
        ("schema_version", Value::Int(2)),
        ("uri", Value::from(format!("s3://media/{}", id))),
        ("media_type", Value::from(media_type)),
        ("content_type", Value::from("application/octet-stream")),
        ("size_bytes", Value::Int(1024)),
        ("checksum", Value::from("00ff")),
        ("pipeline_version", Value::from("test-1")),
        ("created_at", Value::from(CREATED_AT)),
    ]);
    r.insert("tenant_id".to_string(), tenant.into());
    r
}

pub fn media_run(assets: Vec<Row>) -> RunBatch {
    RunBatch::new(Entity::MediaAsset, 2, "test-1").with(FileKind::Core, assets)
}

/// DocChunk run: `(id, text, embedding)` per chunk
pub fn doc_chunk_run(asset_id: &str, chunks: &[(&str, &str, Vec<f32>)]) -> RunBatch {
    let mut core = Vec::new();
    let mut text = Vec::new();
    let mut vector = Vec::new();
    for (i, (id, body, embedding)) in chunks.iter().enumerate() {
        core.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("media_asset_id", Value::from(asset_id)),
            ("chunk_index", Value::Int(i as i64)),
            ("char_start", Value::Int(0)),
            ("char_end", Value::Int(body.len() as i64)),
            ("pipeline_version", Value::from("test-1")),
            ("created_at", Value::from(CREATED_AT)),
        ]));
        text.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("text", Value::from(*body)),
        ]));
        vector.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("embedding", Value::Vector(embedding.clone())),
        ]));
    }
    RunBatch::new(Entity::DocChunk, 1, "test-1")
        .with(FileKind::Core, core)
        .with(FileKind::Text, text)
        .with(FileKind::Vector, vector)
}

/// Transcript run: `(id, text, start_ms, embedding)` per segment
pub fn transcript_run(asset_id: &str, segments: &[(&str, &str, i64, Vec<f32>)]) -> RunBatch {
    let mut core = Vec::new();
    let mut text = Vec::new();
    let mut vector = Vec::new();
    for (i, (id, body, start, embedding)) in segments.iter().enumerate() {
        core.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("media_asset_id", Value::from(asset_id)),
            ("segment_index", Value::Int(i as i64)),
            ("start_ms", Value::Int(*start)),
            ("end_ms", Value::Int(start + 5_000)),
            ("pipeline_version", Value::from("test-1")),
            ("created_at", Value::from(CREATED_AT)),
        ]));
        text.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("text", Value::from(*body)),
        ]));
        vector.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("embedding", Value::Vector(embedding.clone())),
        ]));
    }
    RunBatch::new(Entity::Transcript, 1, "test-1")
        .with(FileKind::Core, core)
        .with(FileKind::Text, text)
        .with(FileKind::Vector, vector)
}

/// ImageAsset run: `(id, caption, timestamp_ms, embedding)` per frame
pub fn image_run(asset_id: &str, frames: &[(&str, Option<&str>, i64, Vec<f32>)]) -> RunBatch {
    let mut core = Vec::new();
    let mut text = Vec::new();
    let mut vector = Vec::new();
    for (i, (id, caption, ts, embedding)) in frames.iter().enumerate() {
        core.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("media_asset_id", Value::from(asset_id)),
            ("frame_index", Value::Int(i as i64)),
            ("timestamp_ms", Value::Int(*ts)),
            ("width", Value::Int(640)),
            ("height", Value::Int(480)),
            ("pipeline_version", Value::from("test-1")),
            ("created_at", Value::from(CREATED_AT)),
        ]));
        text.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("caption", Value::from(*caption)),
        ]));
        vector.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(1)),
            ("embedding", Value::Vector(embedding.clone())),
        ]));
    }
    RunBatch::new(Entity::ImageAsset, 1, "test-1")
        .with(FileKind::Core, core)
        .with(FileKind::Text, text)
        .with(FileKind::Vector, vector)
}

/// AudioClip run at `version`; `channels` is only written for v2 rows
pub fn audio_run(asset_id: &str, version: u32, clips: &[(&str, Option<i64>)]) -> RunBatch {
    let mut core = Vec::new();
    let mut vector = Vec::new();
    for (i, (id, channels)) in clips.iter().enumerate() {
        let mut r = row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(version as i64)),
            ("media_asset_id", Value::from(asset_id)),
            ("start_ms", Value::Int(i as i64 * 1_000)),
            ("end_ms", Value::Int(i as i64 * 1_000 + 1_000)),
            ("sample_rate", Value::Int(16_000)),
            ("pipeline_version", Value::from("test-1")),
            ("created_at", Value::from(CREATED_AT)),
        ]);
        if version >= 2 {
            r.insert("channels".to_string(), (*channels).into());
        }
        core.push(r);
        vector.push(row([
            ("id", Value::from(*id)),
            ("schema_version", Value::Int(version as i64)),
            ("embedding", Value::Vector(media_vector(i))),
        ]));
    }
    RunBatch::new(Entity::AudioClip, version, "test-1")
        .with(FileKind::Core, core)
        .with(FileKind::Vector, vector)
}

/// Text-only embedder: texts mentioning "sample" land on axis 0, the rest on axis 5
pub struct WordEmbedder;

#[async_trait]
impl crate::embed::Embedder for WordEmbedder {
    async fn embed(&self, texts: Vec<String>) -> crate::error::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| text_vector(if t.contains("sample") { 0 } else { 5 }))
            .collect())
    }

    fn model_name(&self) -> &str {
        "word"
    }
}
