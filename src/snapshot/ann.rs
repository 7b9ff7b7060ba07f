//! HNSW index over one vector column
//!
//! Point ids are the row positions of the owning snapshot table. The raw
//! vectors are kept next to the graph so small candidate sets can be scored
//! exactly and the graph can be rebuilt when a snapshot is loaded.

use crate::error::{Error, Result};
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Below this many candidates an exact scan is cheaper than a graph walk
const EXACT_SCAN_LIMIT: usize = 256;

const MAX_LAYER: usize = 16;

/// Graph construction and search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            m: crate::config::default_index_m(),
            ef_construction: crate::config::default_index_ef_construction(),
            ef_search: crate::config::default_index_ef_search(),
        }
    }
}

impl From<&crate::config::IndexConfig> for AnnParams {
    fn from(config: &crate::config::IndexConfig) -> Self {
        Self {
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
        }
    }
}

/// A scored neighbor: row position and similarity in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnHit {
    pub point: usize,
    pub score: f32,
}

pub struct AnnIndex {
    dimension: usize,
    params: AnnParams,
    vectors: Vec<Option<Vec<f32>>>,
    points: usize,
    graph: Option<Hnsw<'static, f32, DistCosine>>,
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("dimension", &self.dimension)
            .field("points", &self.points)
            .field("params", &self.params)
            .finish()
    }
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Similarity score for a cosine distance
pub fn score_from_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 1.0;
    }
    1.0 - dot / denom
}

impl AnnIndex {
    /// Build an index; `vectors[i]` is the vector of row `i`, `None` for rows
    /// without an embedding.
    pub fn build(
        dimension: usize,
        vectors: Vec<Option<Vec<f32>>>,
        params: AnnParams,
    ) -> Result<Self> {
        for (row, vector) in vectors.iter().enumerate() {
            let Some(v) = vector else { continue };
            if v.len() != dimension {
                return Err(Error::InvalidVector(format!(
                    "row {} has {} dimensions, index expects {}",
                    row,
                    v.len(),
                    dimension
                )));
            }
            if norm(v) < f32::EPSILON {
                return Err(Error::InvalidVector(format!("row {} has a zero-norm vector", row)));
            }
        }

        let points = vectors.iter().filter(|v| v.is_some()).count();
        let graph = if points == 0 {
            None
        } else {
            let hnsw = Hnsw::<f32, DistCosine>::new(
                params.m,
                points,
                MAX_LAYER,
                params.ef_construction,
                DistCosine {},
            );
            let data: Vec<(&[f32], usize)> = vectors
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.as_deref().map(|v| (v, i)))
                .collect();
            hnsw.parallel_insert_slice(&data);
            Some(hnsw)
        };

        debug!(dimension, points, m = params.m, "Built HNSW index");
        Ok(Self {
            dimension,
            params,
            vectors,
            points,
            graph,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> AnnParams {
        self.params
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Rough in-memory size of vectors plus graph links
    pub fn approx_bytes(&self) -> u64 {
        let per_point = self.dimension * std::mem::size_of::<f32>()
            + 2 * self.params.m * std::mem::size_of::<usize>();
        (self.points * per_point) as u64
    }

    fn exact(&self, query: &[f32], k: usize, candidates: impl Iterator<Item = usize>) -> Vec<AnnHit> {
        let mut hits: Vec<AnnHit> = candidates
            .filter_map(|point| {
                let v = self.vectors.get(point)?.as_ref()?;
                Some(AnnHit {
                    point,
                    score: score_from_distance(cosine_distance(query, v)),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.point.cmp(&b.point)));
        hits.truncate(k);
        hits
    }

    /// Nearest neighbors of `query`, restricted to `allowed` row positions
    /// when given (sorted ascending). Excluded rows never enter the
    /// candidate list.
    pub fn search(&self, query: &[f32], k: usize, allowed: Option<&[usize]>) -> Result<Vec<AnnHit>> {
        if query.len() != self.dimension {
            return Err(Error::InvalidVector(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if norm(query) < f32::EPSILON {
            return Err(Error::InvalidVector("query vector has zero norm".to_string()));
        }
        let Some(graph) = &self.graph else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        if let Some(allowed) = allowed {
            if allowed.len() <= EXACT_SCAN_LIMIT {
                return Ok(self.exact(query, k, allowed.iter().copied()));
            }
        }
        if self.points <= EXACT_SCAN_LIMIT {
            return Ok(self.exact(query, k, 0..self.vectors.len()));
        }

        let ef = self.params.ef_search.max(k);
        let neighbours = match allowed {
            Some(allowed) => {
                let filter: Vec<usize> = allowed.to_vec();
                graph.search_filter(query, k, ef, Some(&filter as &dyn FilterT))
            }
            None => graph.search(query, k, ef),
        };

        let mut hits: Vec<AnnHit> = neighbours
            .into_iter()
            .map(|n| AnnHit {
                point: n.d_id,
                score: score_from_distance(n.distance),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.point.cmp(&b.point)));
        Ok(hits)
    }
}
