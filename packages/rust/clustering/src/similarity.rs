//! Vector math over embedding vectors.
//!
//! All functions are pure. Mismatched lengths and zero vectors yield a
//! similarity of `0.0` rather than an error.

/// Cosine similarity in `[-1, 1]`.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Normalized weighted mean of two unit centroids with `na` and `nb` members.
pub fn merge_centroids(a: &[f32], na: usize, b: &[f32], nb: usize) -> Vec<f32> {
    let (wa, wb) = (na as f32, nb as f32);
    let sum: Vec<f32> = a.iter().zip(b).map(|(x, y)| x * wa + y * wb).collect();
    normalize(&sum)
}

/// Index and similarity of the candidate most similar to `query`.
///
/// Ties go to the earliest candidate.
pub fn nearest<'a, I>(query: &[f32], candidates: I) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = (usize, &'a [f32])>,
{
    let mut best: Option<(usize, f32)> = None;
    for (index, candidate) in candidates {
        let sim = cosine(query, candidate);
        match best {
            Some((_, best_sim)) if sim <= best_sim => {}
            _ => best = Some((index, sim)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn cosine_basics() {
        assert!(close(cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0));
        assert!(close(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert!(close(cosine(&[1.0, 0.0], &[-2.0, 0.0]), -1.0));
        assert!(close(cosine(&[3.0, 4.0], &[6.0, 8.0]), 1.0));
    }

    #[test]
    fn degenerate_inputs_score_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn normalize_to_unit_length() {
        let v = normalize(&[3.0, 4.0]);
        assert!(close(v[0], 0.6));
        assert!(close(v[1], 0.8));
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn centroid_weights_by_membership() {
        let c = merge_centroids(&[1.0, 0.0], 3, &[0.0, 1.0], 1);
        let expected = normalize(&[3.0, 1.0]);
        assert!(close(c[0], expected[0]));
        assert!(close(c[1], expected[1]));
    }

    #[test]
    fn nearest_prefers_earliest_on_ties() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0];
        let c = [0.0, 1.0];
        let candidates = [(0, &a[..]), (1, &b[..]), (2, &c[..])];
        let (index, sim) = nearest(&[1.0, 0.0], candidates).unwrap();
        assert_eq!(index, 0);
        assert!(close(sim, 1.0));
        assert!(nearest(&[1.0, 0.0], std::iter::empty()).is_none());
    }
}
