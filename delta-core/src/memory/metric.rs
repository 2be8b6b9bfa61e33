//! Similarity metrics over command embeddings.
//!
//! Distance metrics are inverted into a higher-is-better score before
//! ranking, so the store can sort every metric the same way.

use serde::{Deserialize, Serialize};

/// Component threshold for the Jaccard metric: values at or above it count
/// as "set members".
const JACCARD_THRESHOLD: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    DotProduct,
    Euclidean,
    Manhattan,
    Jaccard,
}

impl SimilarityMetric {
    /// Higher-is-better score between two vectors of equal dimension.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "metric inputs must share a dimension");
        match self {
            SimilarityMetric::Cosine => cosine(a, b),
            SimilarityMetric::DotProduct => dot(a, b),
            // Distances invert to 1/(1+d) so zero distance scores 1.0.
            SimilarityMetric::Euclidean => 1.0 / (1.0 + euclidean(a, b)),
            SimilarityMetric::Manhattan => 1.0 / (1.0 + manhattan(a, b)),
            SimilarityMetric::Jaccard => jaccard(a, b),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::DotProduct => "dot_product",
            SimilarityMetric::Euclidean => "euclidean",
            SimilarityMetric::Manhattan => "manhattan",
            SimilarityMetric::Jaccard => "jaccard",
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn manhattan(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// Jaccard over thresholded components: |A ∩ B| / |A ∪ B| where membership
/// means the component exceeds the threshold.
fn jaccard(a: &[f32], b: &[f32]) -> f32 {
    let mut intersection = 0usize;
    let mut union = 0usize;
    for (x, y) in a.iter().zip(b) {
        let in_a = *x > JACCARD_THRESHOLD;
        let in_b = *y > JACCARD_THRESHOLD;
        if in_a || in_b {
            union += 1;
        }
        if in_a && in_b {
            intersection += 1;
        }
    }
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.2, -0.3];
        let score = SimilarityMetric::Cosine.score(&v, &v);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(SimilarityMetric::Cosine.score(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(SimilarityMetric::Cosine.score(&a, &b), 0.0);
    }

    #[test]
    fn euclidean_inverts_to_score() {
        let a = vec![0.0, 0.0];
        let same = SimilarityMetric::Euclidean.score(&a, &a);
        assert!((same - 1.0).abs() < 1e-6);

        let b = vec![3.0, 4.0]; // distance 5
        let far = SimilarityMetric::Euclidean.score(&a, &b);
        assert!((far - 1.0 / 6.0).abs() < 1e-6);
        assert!(same > far);
    }

    #[test]
    fn manhattan_inverts_to_score() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0]; // distance 2
        let score = SimilarityMetric::Manhattan.score(&a, &b);
        assert!((score - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn jaccard_counts_thresholded_overlap() {
        let a = vec![1.0, 1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 1.0, 0.0];
        // intersection 1, union 3
        let score = SimilarityMetric::Jaccard.score(&a, &b);
        assert!((score - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn dot_product_ranks_aligned_vectors_higher() {
        let query = vec![1.0, 1.0];
        let aligned = vec![2.0, 2.0];
        let opposed = vec![-1.0, -1.0];
        assert!(
            SimilarityMetric::DotProduct.score(&query, &aligned)
                > SimilarityMetric::DotProduct.score(&query, &opposed)
        );
    }

    #[test]
    fn metric_serializes_snake_case() {
        let json = serde_json::to_string(&SimilarityMetric::DotProduct).unwrap();
        assert_eq!(json, "\"dot_product\"");
    }
}
