//! SQ8 scalar quantization.
//!
//! Each vector maps to one `u8` per component plus a `(min, max)` scale
//! pair, a ~4x footprint reduction over f32 (`dim + 8` bytes vs `4 * dim`).
//! Quantized distances preserve neighborhood orderings well enough for
//! graph traversal; exact scores are recovered by the rerank pass.
//!
//! Wire format: `[min: f32 LE | max: f32 LE | bytes: u8 * dim]`.

use engram_core::{EngramError, Result};
use serde::{Deserialize, Serialize};

/// Byte value every component takes when the source vector has zero range.
const FLAT_VECTOR_BYTE: u8 = 128;

/// A vector quantized to one byte per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVector {
    pub bytes: Vec<u8>,
    pub min: f32,
    pub max: f32,
}

impl QuantizedVector {
    pub fn dimension(&self) -> usize {
        self.bytes.len()
    }

    /// Scale factor mapping one byte step back to f32 space.
    fn step(&self) -> f32 {
        (self.max - self.min) / 255.0
    }

    /// Reconstructed f32 value of component `i`.
    fn component(&self, i: usize) -> f32 {
        self.min + f32::from(self.bytes[i]) * self.step()
    }
}

/// Quantize a vector to SQ8.
///
/// Components map linearly onto `[0, 255]` between the vector's own min
/// and max. A zero-range vector (all components equal) quantizes to
/// all-128 bytes and dequantizes back to the original scalar.
pub fn quantize(v: &[f32]) -> QuantizedVector {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &x in v {
        min = min.min(x);
        max = max.max(x);
    }
    if v.is_empty() {
        return QuantizedVector {
            bytes: Vec::new(),
            min: 0.0,
            max: 0.0,
        };
    }
    if max <= min {
        return QuantizedVector {
            bytes: vec![FLAT_VECTOR_BYTE; v.len()],
            min,
            max: min,
        };
    }
    let scale = 255.0 / (max - min);
    let bytes = v
        .iter()
        .map(|&x| (((x - min) * scale).round()).clamp(0.0, 255.0) as u8)
        .collect();
    QuantizedVector { bytes, min, max }
}

/// Reconstruct an f32 vector from its quantized form.
///
/// Per-component error is bounded by `(max - min) / 255`.
pub fn dequantize(q: &QuantizedVector) -> Vec<f32> {
    if q.max <= q.min {
        return vec![q.min; q.bytes.len()];
    }
    (0..q.bytes.len()).map(|i| q.component(i)).collect()
}

/// Approximate cosine distance computed directly on quantized vectors.
///
/// Accumulates integer dot products and expands them with the scale
/// factors, avoiding a dequantization allocation per comparison. Returns
/// the maximum distance (1.0) when either operand has zero norm.
pub fn distance_sq8(a: &QuantizedVector, b: &QuantizedVector) -> Result<f32> {
    if a.dimension() != b.dimension() {
        return Err(EngramError::dimension_mismatch(a.dimension(), b.dimension()));
    }
    let dim = a.dimension();
    if dim == 0 {
        return Ok(1.0);
    }

    // Integer accumulators: sum(qa), sum(qb), sum(qa^2), sum(qb^2), sum(qa*qb).
    let mut sum_a: u64 = 0;
    let mut sum_b: u64 = 0;
    let mut sum_aa: u64 = 0;
    let mut sum_bb: u64 = 0;
    let mut sum_ab: u64 = 0;
    for i in 0..dim {
        let qa = u64::from(a.bytes[i]);
        let qb = u64::from(b.bytes[i]);
        sum_a += qa;
        sum_b += qb;
        sum_aa += qa * qa;
        sum_bb += qb * qb;
        sum_ab += qa * qb;
    }

    let (sa, sb) = (a.step(), b.step());
    let (ma, mb) = (a.min, b.min);
    let n = dim as f64;
    let (sum_a, sum_b) = (sum_a as f64, sum_b as f64);
    let (sa, sb, ma, mb) = (f64::from(sa), f64::from(sb), f64::from(ma), f64::from(mb));

    // dot(a, b) where a_i = ma + qa_i * sa and b_i = mb + qb_i * sb.
    let dot = ma * mb * n + ma * sb * sum_b + mb * sa * sum_a + sa * sb * sum_ab as f64;
    let norm_a_sq = ma * ma * n + 2.0 * ma * sa * sum_a + sa * sa * sum_aa as f64;
    let norm_b_sq = mb * mb * n + 2.0 * mb * sb * sum_b + sb * sb * sum_bb as f64;

    if norm_a_sq <= f64::EPSILON || norm_b_sq <= f64::EPSILON {
        return Ok(1.0);
    }
    let similarity = (dot / (norm_a_sq.sqrt() * norm_b_sq.sqrt())).clamp(-1.0, 1.0);
    Ok((1.0 - similarity) as f32)
}

/// Encode to the wire format `[min f32 LE | max f32 LE | bytes]`.
pub fn serialize_sq8(q: &QuantizedVector) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + q.bytes.len());
    out.extend_from_slice(&q.min.to_le_bytes());
    out.extend_from_slice(&q.max.to_le_bytes());
    out.extend_from_slice(&q.bytes);
    out
}

/// Decode from the wire format.
pub fn deserialize_sq8(data: &[u8]) -> Result<QuantizedVector> {
    if data.len() < 8 {
        return Err(EngramError::internal(format!(
            "SQ8 blob too short: {} bytes",
            data.len()
        )));
    }
    let min = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let max = f32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok(QuantizedVector {
        bytes: data[8..].to_vec(),
        min,
        max,
    })
}
