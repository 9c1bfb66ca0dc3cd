use crate::index::EmbeddingRecord;

/// Cosine similarity clamped to `[-1, 1]`. Zero-norm, empty or mismatched
/// vectors score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    // f64 accumulators keep large components from overflowing and tiny ones
    // from flushing to zero.
    let (dot, na, nb) = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| (f64::from(x), f64::from(y)))
        .fold((0.0f64, 0.0f64, 0.0f64), |(d, aa, bb), (x, y)| {
            (d + (x * y), aa + (x * x), bb + (y * y))
        });

    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0) as f32
    }
}

/// Position and score of the most similar record. Left-to-right scan that only
/// replaces the best on a strictly greater score, so ties go to the earlier record.
pub fn best_match(query_embedding: &[f32], records: &[EmbeddingRecord]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;

    for (idx, record) in records.iter().enumerate() {
        let score = cosine_similarity(query_embedding, &record.vector);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((idx, score));
        }
    }

    best
}

/// Up to `k` positions by descending score; equal scores keep load order.
pub fn top_k(
    query_embedding: &[f32],
    records: &[EmbeddingRecord],
    k: usize,
) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| (idx, cosine_similarity(query_embedding, &record.vector)))
        .collect();

    // stable sort
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}
