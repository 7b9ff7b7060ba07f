//! Result ordering, keyword scoring and hybrid fusion

use super::{Modality, SearchHit};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Longest snippet returned with a hit, in characters
pub const SNIPPET_CHARS: usize = 200;

/// Total order over hits: score descending, then modality priority, then id
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.modality.priority().cmp(&b.modality.priority()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort and keep the best `k`
pub fn top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

/// Lowercased, deduplicated query terms of at least two characters
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Fraction of `terms` that occur in `text`
pub fn keyword_score(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f32 / terms.len() as f32
}

/// Weighted fusion of semantic and keyword results: `(1-w)·semantic +
/// w·keyword`, with a missing side counting as zero
pub fn fuse_hybrid(semantic: Vec<SearchHit>, keyword: Vec<SearchHit>, weight: f32) -> Vec<SearchHit> {
    let w = weight.clamp(0.0, 1.0);
    let mut fused: HashMap<(Modality, String), (SearchHit, f32, f32)> = HashMap::new();

    for hit in semantic {
        let key = (hit.modality, hit.id.clone());
        let score = hit.score;
        fused.entry(key).or_insert((hit, 0.0, 0.0)).1 = score;
    }
    for hit in keyword {
        let key = (hit.modality, hit.id.clone());
        let score = hit.score;
        fused.entry(key).or_insert((hit, 0.0, 0.0)).2 = score;
    }

    fused
        .into_values()
        .map(|(mut hit, sem, kw)| {
            hit.score = ((1.0 - w) * sem + w * kw).clamp(0.0, 1.0);
            hit
        })
        .collect()
}

/// Truncate to [`SNIPPET_CHARS`] characters on a char boundary
pub fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(SNIPPET_CHARS) {
        Some((end, _)) => format!("{}…", &trimmed[..end]),
        None => trimmed.to_string(),
    }
}
