//! Vector and lexical similarity primitives used for ranking and clustering.

use std::collections::HashSet;

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm
/// or the dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Lower-cased, whitespace-separated word set of `text`.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|` of the word sets of two texts.
///
/// Two empty texts are considered dissimilar (`0.0`).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    jaccard_of_sets(&word_set(a), &word_set(b))
}

pub fn jaccard_of_sets(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Share of the query's terms that occur in `text`, in `[0.0, 1.0]`.
///
/// Used as the lexical fallback when no embedding is available.  Punctuation
/// is stripped so `"drawdown,"` still matches `"drawdown"`.
pub fn term_overlap(query: &str, text: &str) -> f64 {
    let query_terms = normalized_terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = normalized_terms(text);
    let hits = query_terms.iter().filter(|t| text_terms.contains(*t)).count();
    hits as f64 / query_terms.len() as f64
}

fn normalized_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector_returns_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn jaccard_ignores_case_and_duplicates() {
        let j = jaccard_similarity("Stop Loss stop", "stop loss");
        assert!((j - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jaccard_partial_overlap() {
        // {a, b, c} vs {b, c, d}: 2 / 4
        assert!((jaccard_similarity("a b c", "b c d") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn jaccard_of_empty_texts_is_zero() {
        assert_eq!(jaccard_similarity("", "   "), 0.0);
    }

    #[test]
    fn term_overlap_strips_punctuation() {
        let score = term_overlap("drawdown limits", "Max drawdown, hit limits!");
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(term_overlap("leverage", "no match here"), 0.0);
        assert_eq!(term_overlap("", "anything"), 0.0);
    }
}
