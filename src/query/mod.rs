//! Query execution against a loaded snapshot
//!
//! Semantic search embeds the query once per embedding space, restricts
//! candidates to the caller's scope in SQL before the HNSW search, then
//! projects the winning rows into [`SearchHit`]s. Keyword and metadata
//! search run purely in SQL.

mod cache;
mod rank;

pub use cache::*;
pub use rank::*;

use crate::config::QueryConfig;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::registry::{EmbeddingSpace, Entity};
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Kind of result a hit refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Document,
    Transcript,
    Image,
    Audio,
    Media,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Document,
        Modality::Transcript,
        Modality::Image,
        Modality::Audio,
        Modality::Media,
    ];

    /// Modalities that carry an embedding
    pub const SEMANTIC: [Modality; 4] = [
        Modality::Document,
        Modality::Transcript,
        Modality::Image,
        Modality::Audio,
    ];

    /// Modalities with a searchable text column
    pub const KEYWORD: [Modality; 3] = [Modality::Document, Modality::Transcript, Modality::Image];

    pub fn entity(&self) -> Entity {
        match self {
            Modality::Document => Entity::DocChunk,
            Modality::Transcript => Entity::Transcript,
            Modality::Image => Entity::ImageAsset,
            Modality::Audio => Entity::AudioClip,
            Modality::Media => Entity::MediaAsset,
        }
    }

    /// Tie-break rank; lower sorts first
    pub fn priority(&self) -> u8 {
        match self {
            Modality::Document => 0,
            Modality::Transcript => 1,
            Modality::Image => 2,
            Modality::Audio => 3,
            Modality::Media => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Document => "document",
            Modality::Transcript => "transcript",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Media => "media",
        }
    }

    /// Column holding the snippet text
    fn snippet_column(&self) -> Option<&'static str> {
        match self {
            Modality::Document | Modality::Transcript => Some("text"),
            Modality::Image => Some("caption"),
            Modality::Audio => None,
            Modality::Media => Some("uri"),
        }
    }

    /// Column holding the offset into the parent asset
    fn position_column(&self) -> Option<&'static str> {
        match self {
            Modality::Transcript | Modality::Audio => Some("start_ms"),
            Modality::Image => Some("timestamp_ms"),
            Modality::Document | Modality::Media => None,
        }
    }

    fn asset_column(&self) -> &'static str {
        match self {
            Modality::Media => "id",
            _ => "media_asset_id",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Modality::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("Unknown modality: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
    Metadata,
}

/// Tenant scoping; every set field must match the owning MediaAsset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub tenant_id: Option<String>,
    pub org_id: Option<String>,
    pub site_id: Option<String>,
    pub stream_id: Option<String>,
}

impl ScopeFilter {
    pub fn is_empty(&self) -> bool {
        self.predicates().is_empty()
    }

    fn predicates(&self) -> Vec<(&'static str, &str)> {
        [
            ("tenant_id", &self.tenant_id),
            ("org_id", &self.org_id),
            ("site_id", &self.site_id),
            ("stream_id", &self.stream_id),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.as_deref().map(|v| (column, v)))
        .collect()
    }
}

/// MediaAsset attribute filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub media_type: Option<String>,
    pub content_type: Option<String>,
    pub uri_prefix: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query_text: Option<String>,
    pub image_bytes: Option<Vec<u8>>,
    pub top_k: usize,
    pub modalities: Option<Vec<Modality>>,
    /// Defaults to semantic, or metadata when there is no text or image
    pub mode: Option<SearchMode>,
    pub scope: ScopeFilter,
    pub metadata: Option<MetadataFilter>,
}

/// Options shared by every search entry point
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: usize,
    pub modalities: Option<Vec<Modality>>,
    pub scope: ScopeFilter,
}

impl SearchOptions {
    pub fn top(k: usize) -> Self {
        Self {
            top_k: k,
            ..Self::default()
        }
    }

    fn modalities_or(&self, default: &[Modality]) -> Vec<Modality> {
        self.modalities.clone().unwrap_or_else(|| default.to_vec())
    }
}

impl From<&QueryRequest> for SearchOptions {
    fn from(request: &QueryRequest) -> Self {
        Self {
            top_k: request.top_k,
            modalities: request.modalities.clone(),
            scope: request.scope.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub media_asset_id: String,
    pub modality: Modality,
    pub snippet: Option<String>,
    pub position_ms: Option<i64>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
enum QueryInput<'a> {
    Text(&'a str),
    Image(&'a [u8]),
}

/// `FROM` clause and scope predicates for one modality's table
struct ScopedTable {
    from: String,
    conditions: Vec<String>,
    binds: Vec<String>,
}

impl ScopedTable {
    fn new(modality: Modality, scope: &ScopeFilter) -> Self {
        let table = modality.entity().table_name();
        let (from, owner) = if modality == Modality::Media || scope.is_empty() {
            (format!("{} t", table), "t")
        } else {
            (
                format!(
                    "{} t JOIN {} m ON m.id = t.media_asset_id",
                    table,
                    Entity::MediaAsset.table_name()
                ),
                "m",
            )
        };

        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        for (column, value) in scope.predicates() {
            conditions.push(format!("{}.{} = ?", owner, column));
            binds.push(value.to_string());
        }
        Self {
            from,
            conditions,
            binds,
        }
    }

    fn condition(&mut self, sql: String, binds: impl IntoIterator<Item = String>) {
        self.conditions.push(sql);
        self.binds.extend(binds);
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

fn select_list(modality: Modality) -> String {
    let column = |c: Option<&str>| c.map(|c| format!("t.{}", c)).unwrap_or_else(|| "NULL".to_string());
    format!(
        "t.ann_id AS ann_id, t.id AS id, t.{} AS media_asset_id, {} AS snippet, {} AS position_ms",
        modality.asset_column(),
        column(modality.snippet_column()),
        column(modality.position_column()),
    )
}

fn hit_from_row(modality: Modality, row: &SqliteRow, score: f32) -> Result<SearchHit> {
    let snippet: Option<String> = row.try_get("snippet")?;
    let media_asset_id: Option<String> = row.try_get("media_asset_id")?;
    Ok(SearchHit {
        id: row.try_get("id")?,
        media_asset_id: media_asset_id.unwrap_or_default(),
        modality,
        snippet: snippet.map(|s| rank::snippet(&s)),
        position_ms: row.try_get("position_ms")?,
        score,
    })
}

/// Executes searches with a cached, time-bounded query embedder
pub struct QueryRunner {
    embedder: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    config: QueryConfig,
    timeout: Duration,
}

impl QueryRunner {
    pub fn new(embedder: Arc<dyn Embedder>, config: &QueryConfig) -> Self {
        Self {
            embedder,
            cache: EmbeddingCache::new(config.cache_capacity),
            config: config.clone(),
            timeout: Duration::from_millis(config.embed_timeout_ms),
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Validate and dispatch a request
    pub async fn run(&self, snapshot: &Snapshot, request: &QueryRequest) -> Result<Vec<SearchHit>> {
        let started = Instant::now();
        let options = SearchOptions::from(request);
        let text = request
            .query_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let mode = request.mode.unwrap_or(
            if text.is_none() && request.image_bytes.is_none() {
                SearchMode::Metadata
            } else {
                SearchMode::Semantic
            },
        );
        let need_text = || {
            text.ok_or_else(|| Error::Validation("query text must not be empty".to_string()))
        };

        let hits = match mode {
            SearchMode::Semantic => match (&request.image_bytes, text) {
                (Some(image), _) => self.search_by_image(snapshot, image, &options).await?,
                (None, Some(text)) => self.search_by_text(snapshot, text, &options).await?,
                (None, None) => {
                    return Err(Error::Validation(
                        "semantic search needs query text or an image".to_string(),
                    ))
                }
            },
            SearchMode::Keyword => self.search_by_keyword(snapshot, need_text()?, &options).await?,
            SearchMode::Hybrid => self.search_hybrid(snapshot, need_text()?, &options).await?,
            SearchMode::Metadata => {
                let filter = request.metadata.clone().unwrap_or_default();
                self.search_by_metadata(snapshot, &filter, &options).await?
            }
        };

        info!(
            snapshot = %snapshot.id(),
            mode = ?mode,
            hits = hits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query complete"
        );
        Ok(hits)
    }

    pub async fn search_by_text(
        &self,
        snapshot: &Snapshot,
        text: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_k(options.top_k)?;
        if text.trim().is_empty() {
            return Err(Error::Validation("query text must not be empty".to_string()));
        }
        self.semantic(snapshot, QueryInput::Text(text), options, options.top_k)
            .await
    }

    pub async fn search_by_image(
        &self,
        snapshot: &Snapshot,
        image: &[u8],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_k(options.top_k)?;
        if image.is_empty() {
            return Err(Error::Validation("image must not be empty".to_string()));
        }
        self.semantic(snapshot, QueryInput::Image(image), options, options.top_k)
            .await
    }

    pub async fn search_by_keyword(
        &self,
        snapshot: &Snapshot,
        text: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_k(options.top_k)?;
        let terms = keyword_terms(text);
        if terms.is_empty() {
            return Err(Error::Validation(
                "keyword search needs at least one term of two or more characters".to_string(),
            ));
        }
        let hits = self.keyword(snapshot, &terms, options).await?;
        Ok(top_k(hits, options.top_k))
    }

    /// Semantic and keyword search fused with `query.keyword_weight`
    pub async fn search_hybrid(
        &self,
        snapshot: &Snapshot,
        text: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_k(options.top_k)?;
        let terms = keyword_terms(text);
        if text.trim().is_empty() || terms.is_empty() {
            return Err(Error::Validation(
                "hybrid search needs at least one term of two or more characters".to_string(),
            ));
        }
        let candidates = options.top_k.saturating_mul(4);
        let semantic = self
            .semantic(snapshot, QueryInput::Text(text), options, candidates)
            .await?;
        let keyword = self.keyword(snapshot, &terms, options).await?;
        debug!(semantic = semantic.len(), keyword = keyword.len(), "Fusing hybrid results");
        Ok(top_k(
            fuse_hybrid(semantic, keyword, self.config.keyword_weight),
            options.top_k,
        ))
    }

    /// Filter MediaAsset rows; every match scores 1.0
    pub async fn search_by_metadata(
        &self,
        snapshot: &Snapshot,
        filter: &MetadataFilter,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_k(options.top_k)?;
        if let (Some(after), Some(before)) = (filter.created_after, filter.created_before) {
            if after > before {
                return Err(Error::Validation(
                    "created_after must not be later than created_before".to_string(),
                ));
            }
        }

        let modality = Modality::Media;
        let mut table = ScopedTable::new(modality, &options.scope);
        if let Some(media_type) = &filter.media_type {
            table.condition("t.media_type = ?".to_string(), [media_type.clone()]);
        }
        if let Some(content_type) = &filter.content_type {
            table.condition("t.content_type = ?".to_string(), [content_type.clone()]);
        }
        if let Some(prefix) = &filter.uri_prefix {
            table.condition(
                "substr(t.uri, 1, length(?)) = ?".to_string(),
                [prefix.clone(), prefix.clone()],
            );
        }
        if let Some(after) = filter.created_after {
            table.condition(
                "julianday(t.created_at) >= julianday(?)".to_string(),
                [after.to_rfc3339()],
            );
        }
        if let Some(before) = filter.created_before {
            table.condition(
                "julianday(t.created_at) <= julianday(?)".to_string(),
                [before.to_rfc3339()],
            );
        }

        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY t.id LIMIT {}",
            select_list(modality),
            table.from,
            table.where_clause(),
            options.top_k
        );
        let mut query = sqlx::query(&sql);
        for bind in &table.binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(snapshot.pool()).await?;
        rows.iter()
            .map(|row| hit_from_row(modality, row, 1.0))
            .collect()
    }

    fn check_k(&self, k: usize) -> Result<()> {
        if k == 0 {
            return Err(Error::Validation("top_k must be at least 1".to_string()));
        }
        if k > self.config.max_results {
            return Err(Error::Validation(format!(
                "top_k {} exceeds the maximum of {}",
                k, self.config.max_results
            )));
        }
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn query_vector(
        &self,
        input: QueryInput<'_>,
        space: EmbeddingSpace,
    ) -> Result<Arc<Vec<f32>>> {
        let key = match input {
            QueryInput::Text(text) => CacheKey::text(space, text),
            QueryInput::Image(bytes) => {
                if space != EmbeddingSpace::Image {
                    return Err(Error::Unsupported(format!(
                        "image queries cannot be compared against {} embeddings",
                        space.as_str()
                    )));
                }
                CacheKey::image(bytes)
            }
        };
        if let Some(vector) = self.cache.get(&key).await {
            return Ok(vector);
        }

        let vectors = match input {
            QueryInput::Text(_) => {
                self.bounded(self.embedder.embed_text_in(space, vec![key.input.clone()]))
                    .await?
            }
            QueryInput::Image(bytes) => {
                self.bounded(self.embedder.embed_images(vec![bytes.to_vec()]))
                    .await?
            }
        };
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("No embedding returned".to_string()))?;
        if vector.len() != space.dimension() {
            return Err(Error::Embedding(format!(
                "Expected a {}-dimensional {} embedding, got {}",
                space.dimension(),
                space.as_str(),
                vector.len()
            )));
        }

        let vector = Arc::new(vector);
        self.cache.insert(key, vector.clone()).await;
        Ok(vector)
    }

    async fn semantic(
        &self,
        snapshot: &Snapshot,
        input: QueryInput<'_>,
        options: &SearchOptions,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        let mut embedded_any = false;
        let mut unsupported = None;

        for modality in options.modalities_or(&Modality::SEMANTIC) {
            let entity = modality.entity();
            let (Some(space), Some(index)) = (entity.embedding_space(), snapshot.index(entity))
            else {
                continue;
            };

            let query = match self.query_vector(input, space).await {
                Ok(query) => query,
                Err(e @ Error::Unsupported(_)) => {
                    debug!(modality = %modality, error = %e, "Skipping modality");
                    unsupported.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            embedded_any = true;
            if index.is_empty() {
                continue;
            }

            let allowed = if options.scope.is_empty() {
                None
            } else {
                Some(self.allowed_points(snapshot, modality, &options.scope).await?)
            };
            if allowed.as_ref().is_some_and(|a| a.is_empty()) {
                continue;
            }

            let found = index.search(&query, k, allowed.as_deref())?;
            debug!(modality = %modality, candidates = found.len(), "Index search");
            hits.extend(self.project(snapshot, modality, &found).await?);
        }

        if !embedded_any {
            if let Some(e) = unsupported {
                return Err(e);
            }
        }
        Ok(top_k(hits, k))
    }

    /// Sorted row positions of `modality` visible under `scope`
    async fn allowed_points(
        &self,
        snapshot: &Snapshot,
        modality: Modality,
        scope: &ScopeFilter,
    ) -> Result<Vec<usize>> {
        let table = ScopedTable::new(modality, scope);
        let sql = format!(
            "SELECT t.ann_id FROM {}{} ORDER BY t.ann_id",
            table.from,
            table.where_clause()
        );
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for bind in &table.binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(snapshot.pool()).await?;
        Ok(rows.into_iter().map(|(p,)| p as usize).collect())
    }

    async fn project(
        &self,
        snapshot: &Snapshot,
        modality: Modality,
        found: &[crate::snapshot::AnnHit],
    ) -> Result<Vec<SearchHit>> {
        if found.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; found.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM {} t WHERE t.ann_id IN ({})",
            select_list(modality),
            modality.entity().table_name(),
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for hit in found {
            query = query.bind(hit.point as i64);
        }
        let rows = query.fetch_all(snapshot.pool()).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let point = row.try_get::<i64, _>("ann_id")? as usize;
            if let Some(found) = found.iter().find(|h| h.point == point) {
                hits.push(hit_from_row(modality, row, found.score)?);
            }
        }
        Ok(hits)
    }

    async fn keyword(
        &self,
        snapshot: &Snapshot,
        terms: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for modality in options.modalities_or(&Modality::KEYWORD) {
            if !Modality::KEYWORD.contains(&modality) {
                continue;
            }
            let Some(column) = modality.snippet_column() else {
                continue;
            };

            let mut table = ScopedTable::new(modality, &options.scope);
            let likes =
                vec![format!("t.{} LIKE ? ESCAPE '\\'", column); terms.len()].join(" OR ");
            table.condition(format!("({})", likes), terms.iter().map(|t| contains_pattern(t)));
            let sql = format!(
                "SELECT {}, t.{} AS body FROM {}{}",
                select_list(modality),
                column,
                table.from,
                table.where_clause()
            );
            let mut query = sqlx::query(&sql);
            for bind in &table.binds {
                query = query.bind(bind);
            }
            let rows = query.fetch_all(snapshot.pool()).await?;
            debug!(modality = %modality, matches = rows.len(), "Keyword scan");

            for row in &rows {
                let body: Option<String> = row.try_get("body")?;
                let score = keyword_score(terms, body.as_deref().unwrap_or_default());
                if score > 0.0 {
                    hits.push(hit_from_row(modality, row, score)?);
                }
            }
        }
        Ok(hits)
    }
}

/// `LIKE` pattern matching `term` literally anywhere in a column
fn contains_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fixtures::{
        doc_chunk_run, image_run, media_asset, media_run, media_vector, text_vector,
    };
    use crate::snapshot::{AnnParams, SnapshotBuilder, SnapshotHandle, SnapshotLoader};
    use crate::storage::Storage;
    use crate::writer::{RunBatch, RunWriter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Maps known words onto fixed axes so similarity is predictable
    #[derive(Default)]
    struct FakeEmbedder {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeEmbedder {
        fn axis(text: &str) -> usize {
            if text.contains("sample") {
                0
            } else if text.contains("meeting") {
                1
            } else {
                5
            }
        }

        async fn pause(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            self.pause().await;
            Ok(texts.iter().map(|t| text_vector(Self::axis(t))).collect())
        }

        async fn embed_text_in(
            &self,
            space: EmbeddingSpace,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>> {
            match space {
                EmbeddingSpace::Text => self.embed(texts).await,
                EmbeddingSpace::Image => {
                    self.pause().await;
                    Ok(texts.iter().map(|t| media_vector(Self::axis(t))).collect())
                }
                EmbeddingSpace::Audio => Err(Error::Unsupported("no audio model".to_string())),
            }
        }

        async fn embed_images(&self, images: Vec<Vec<u8>>) -> Result<Vec<Vec<f32>>> {
            self.pause().await;
            Ok(images.iter().map(|_| media_vector(0)).collect())
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    async fn snapshot_of(runs: Vec<RunBatch>) -> (TempDir, Snapshot) {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        let writer = RunWriter::new(storage.clone());
        for run in &runs {
            writer.write_run(run).await.unwrap();
        }
        SnapshotBuilder::new(storage.clone(), AnnParams::default(), tmp.path().join("work"))
            .build()
            .await
            .unwrap();
        let snapshot = SnapshotLoader::new(storage, tmp.path().join("cache"))
            .load_latest()
            .await
            .unwrap();
        (tmp, snapshot)
    }

    fn runner(embedder: FakeEmbedder) -> QueryRunner {
        QueryRunner::new(Arc::new(embedder), &Config::default().query)
    }

    fn three_chunks() -> RunBatch {
        doc_chunk_run(
            "m1",
            &[
                ("c1", "a sample paragraph", text_vector(0)),
                ("c2", "sample notes from the meeting", text_vector(1)),
                ("c3", "unrelated", text_vector(2)),
            ],
        )
    }

    #[tokio::test]
    async fn test_search_by_text_returns_top_k_descending() {
        let (_tmp, snapshot) = snapshot_of(vec![three_chunks()]).await;
        let runner = runner(FakeEmbedder::default());

        let hits = runner
            .search_by_text(&snapshot, "sample", &SearchOptions::top(2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[0].modality, Modality::Document);
        assert_eq!(hits[0].media_asset_id, "m1");
        assert_eq!(hits[0].snippet.as_deref(), Some("a sample paragraph"));
        assert_eq!(hits[0].position_ms, None);
    }

    #[tokio::test]
    async fn test_scope_filter_excludes_other_tenants() {
        let (_tmp, snapshot) = snapshot_of(vec![
            media_run(vec![
                media_asset("m1", "document", Some("acme")),
                media_asset("m2", "document", Some("globex")),
            ]),
            doc_chunk_run("m1", &[("a1", "sample from acme", text_vector(0))]),
            doc_chunk_run("m2", &[("b1", "sample from globex", text_vector(0))]),
        ])
        .await;
        let runner = runner(FakeEmbedder::default());

        let mut options = SearchOptions::top(10);
        options.scope.tenant_id = Some("acme".to_string());
        let hits = runner.search_by_text(&snapshot, "sample", &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a1");

        let hits = runner.search_by_keyword(&snapshot, "sample", &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].media_asset_id, "m1");

        options.scope.tenant_id = Some("initech".to_string());
        assert!(runner
            .search_by_text(&snapshot, "sample", &options)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_scores_term_fraction() {
        let (_tmp, snapshot) = snapshot_of(vec![doc_chunk_run(
            "m1",
            &[
                ("k1", "Quarterly report for Q3", text_vector(0)),
                ("k2", "weekly report", text_vector(1)),
                ("k3", "nothing relevant", text_vector(2)),
            ],
        )])
        .await;
        let runner = runner(FakeEmbedder::default());

        let hits = runner
            .search_by_keyword(&snapshot, "quarterly report", &SearchOptions::top(10))
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "k2"]);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("report"), "%report%");
        assert_eq!(contains_pattern("50%"), "%50\\%%");
        assert_eq!(contains_pattern("a_b\\c"), "%a\\_b\\\\c%");
    }

    #[tokio::test]
    async fn test_keyword_wildcards_match_literally() {
        let (_tmp, snapshot) = snapshot_of(vec![doc_chunk_run(
            "m1",
            &[
                ("w1", "50% off everything", text_vector(0)),
                ("w2", "500 units shipped", text_vector(1)),
                ("w3", "file_name.txt", text_vector(2)),
                ("w4", "filexname", text_vector(3)),
            ],
        )])
        .await;
        let runner = runner(FakeEmbedder::default());
        let options = SearchOptions::top(10);

        for (term, expected) in [("50%", "w1"), ("file_name", "w3")] {
            let hits = runner
                .keyword(&snapshot, &[term.to_string()], &options)
                .await
                .unwrap();
            let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
            assert_eq!(ids, vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_hybrid_blends_scores() {
        let (_tmp, snapshot) = snapshot_of(vec![doc_chunk_run(
            "m1",
            &[
                ("h1", "sample", text_vector(3)),
                ("h2", "different words", text_vector(0)),
            ],
        )])
        .await;
        let runner = runner(FakeEmbedder::default());

        let hits = runner
            .search_hybrid(&snapshot, "sample", &SearchOptions::top(2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "h2");
        assert_eq!(hits[1].id, "h1");
        assert!(hits[1].score > 0.3);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[tokio::test]
    async fn test_metadata_search() {
        let (_tmp, snapshot) = snapshot_of(vec![media_run(vec![
            media_asset("m1", "document", None),
            media_asset("m2", "video", None),
        ])])
        .await;
        let runner = runner(FakeEmbedder::default());
        let options = SearchOptions::top(10);

        let filter = MetadataFilter {
            media_type: Some("video".to_string()),
            ..Default::default()
        };
        let hits = runner.search_by_metadata(&snapshot, &filter, &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m2");
        assert_eq!(hits[0].media_asset_id, "m2");
        assert_eq!(hits[0].modality, Modality::Media);
        assert_eq!(hits[0].snippet.as_deref(), Some("s3://media/m2"));
        assert_eq!(hits[0].score, 1.0);

        let filter = MetadataFilter {
            uri_prefix: Some("s3://media/m1".to_string()),
            ..Default::default()
        };
        let hits = runner.search_by_metadata(&snapshot, &filter, &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");

        let filter = MetadataFilter {
            created_after: Some("2027-01-01T00:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        assert!(runner
            .search_by_metadata(&snapshot, &filter, &options)
            .await
            .unwrap()
            .is_empty());

        let all = runner
            .run(&snapshot, &QueryRequest { top_k: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_cross_modal_and_image_queries() {
        let (_tmp, snapshot) = snapshot_of(vec![
            three_chunks(),
            image_run("m1", &[("f1", Some("a sample frame"), 4_000, media_vector(0))]),
        ])
        .await;
        let runner = runner(FakeEmbedder::default());

        let hits = runner
            .search_by_text(&snapshot, "sample", &SearchOptions::top(10))
            .await
            .unwrap();
        let frame = hits.iter().find(|h| h.modality == Modality::Image).unwrap();
        assert_eq!(frame.id, "f1");
        assert_eq!(frame.position_ms, Some(4_000));
        assert_eq!(frame.snippet.as_deref(), Some("a sample frame"));

        let hits = runner
            .search_by_image(&snapshot, b"\x89PNG fake", &SearchOptions::top(10))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].modality, Modality::Image);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (_tmp, snapshot) = snapshot_of(vec![three_chunks()]).await;
        let runner = runner(FakeEmbedder::default());

        let request = |text: &str, top_k| QueryRequest {
            query_text: Some(text.to_string()),
            top_k,
            mode: Some(SearchMode::Semantic),
            ..Default::default()
        };
        for bad in [request("sample", 0), request("sample", 1_000), request("   ", 5)] {
            let err = runner.run(&snapshot, &bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{err}");
        }

        let keyword = QueryRequest {
            query_text: Some("a".to_string()),
            top_k: 5,
            mode: Some(SearchMode::Keyword),
            ..Default::default()
        };
        assert!(matches!(
            runner.run(&snapshot, &keyword).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_embedding_timeout_is_recoverable() {
        let (_tmp, snapshot) = snapshot_of(vec![three_chunks()]).await;
        let mut config = Config::default().query;
        config.embed_timeout_ms = 20;
        let runner = QueryRunner::new(
            Arc::new(FakeEmbedder {
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            }),
            &config,
        );

        let err = runner
            .search_by_text(&snapshot, "sample", &SearchOptions::top(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_query_embeddings_are_cached() {
        let (_tmp, snapshot) = snapshot_of(vec![three_chunks()]).await;
        let embedder = Arc::new(FakeEmbedder::default());
        let runner = QueryRunner::new(embedder.clone(), &Config::default().query);

        let options = SearchOptions {
            top_k: 2,
            modalities: Some(vec![Modality::Document]),
            ..Default::default()
        };
        runner.search_by_text(&snapshot, "Sample", &options).await.unwrap();
        runner.search_by_text(&snapshot, "  sample ", &options).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        let stats = runner.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_hot_swap_keeps_in_flight_snapshot() {
        let (_old_tmp, old) = snapshot_of(vec![three_chunks()]).await;
        let (_new_tmp, new) = snapshot_of(vec![doc_chunk_run(
            "m9",
            &[("n1", "sample of the new data", text_vector(0))],
        )])
        .await;
        let old_id = old.id().to_string();
        let runner = runner(FakeEmbedder::default());

        let handle = SnapshotHandle::new(old);
        let in_flight = handle.current().await;
        handle.swap(new).await;

        let hits = runner
            .search_by_text(&in_flight, "sample", &SearchOptions::top(1))
            .await
            .unwrap();
        assert_eq!(in_flight.id(), old_id);
        assert_eq!(hits[0].id, "c1");

        let current = handle.current().await;
        assert_ne!(current.id(), old_id);
        let hits = runner
            .search_by_text(&current, "sample", &SearchOptions::top(1))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "n1");
    }
}
