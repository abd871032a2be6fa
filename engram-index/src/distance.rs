//! Distance kernels over f32 vectors.
//!
//! All public entry points validate that both operands share one length and
//! fail with `DimensionMismatch` otherwise. The `*_unchecked` variants skip
//! the check for hot loops that already validated at the boundary.

use engram_core::{EngramError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Batches at least this large fan out across the rayon pool.
const PARALLEL_BATCH_THRESHOLD: usize = 256;

/// Distance metric for vector comparison. Lower is always closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// Calculate the distance between two equal-length vectors.
    pub fn calculate(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_unchecked(a, b),
            Self::Euclidean => euclidean_unchecked(a, b),
        }
    }
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EngramError::dimension_mismatch(a.len(), b.len()));
    }
    Ok(())
}

/// Euclidean (L2) distance.
pub fn euclidean(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(euclidean_unchecked(a, b))
}

pub(crate) fn euclidean_unchecked(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Cosine distance: `1 - cos(a, b)`, in `[0, 2]`.
///
/// Zero-norm operands compare at the maximum useful distance (1.0), the
/// same convention the quantized kernel uses.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(cosine_unchecked(a, b))
}

pub(crate) fn cosine_unchecked(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    1.0 - similarity
}

/// Dot product of two vectors.
pub fn dot(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Normalize a vector to unit length in place. Zero vectors are unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Distances from one query to many vectors.
///
/// Large batches fan out across the rayon pool; the returned array is
/// always in input order regardless of execution order.
pub fn batch_distance(query: &[f32], vectors: &[Vec<f32>], metric: DistanceMetric) -> Result<Vec<f32>> {
    for v in vectors {
        check_dims(query, v)?;
    }
    if vectors.len() >= PARALLEL_BATCH_THRESHOLD {
        Ok(vectors
            .par_iter()
            .map(|v| metric.calculate(query, v))
            .collect())
    } else {
        Ok(vectors.iter().map(|v| metric.calculate(query, v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![3.0, 4.0, 0.0];
        assert!((euclidean(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!(cosine(&a, &a).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine(&a, &b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm_is_max_distance() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert_eq!(cosine(&a, &b).unwrap(), 1.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            cosine(&a, &b),
            Err(EngramError::DimensionMismatch { expected: 2, got: 3 })
        ));
        assert!(euclidean(&a, &b).is_err());
        assert!(dot(&a, &b).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_batch_distance_order() {
        let query = vec![1.0, 0.0];
        // Enough vectors to cross the parallel threshold.
        let vectors: Vec<Vec<f32>> = (0..300)
            .map(|i| {
                let angle = i as f32 * 0.01;
                vec![angle.cos(), angle.sin()]
            })
            .collect();

        let distances = batch_distance(&query, &vectors, DistanceMetric::Cosine).unwrap();
        assert_eq!(distances.len(), vectors.len());
        // Input order preserved: distances grow with the angle.
        for w in distances.windows(2) {
            assert!(w[0] <= w[1] + 1e-6);
        }
    }

    #[test]
    fn test_batch_distance_rejects_ragged_input() {
        let query = vec![1.0, 0.0];
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]];
        assert!(batch_distance(&query, &vectors, DistanceMetric::Cosine).is_err());
    }
}
