//! Quantized tensor kernels
//!
//! Pure Rust implementation of the Q4_0 block format used by GGUF weights,
//! plus the F16/F32 primitives the container carries alongside it.
//!
//! ## Block layout (Q4_0)
//!
//! ```text
//! | f16 scale (2 bytes) | 16 bytes of packed nibbles |   = 18 bytes / 32 values
//! ```
//!
//! Each byte holds two 4-bit unsigned values; the low nibble of byte `i`
//! is block index `i`, the high nibble is block index `i + 16`. The
//! dequantized value is `scale * (nibble - 8)`.
//!
//! ## Kernels
//!
//! - [`dequantize_q4_0`] / [`dequantize_f16`] - full dequantization
//! - [`matvec_q4_0_into`] - fused dequantize + matrix-vector multiply
//! - [`matvec_f32_into`] / [`matvec_f16_into`] - float matvec
//!
//! The fused kernels never materialize the dequantized matrix: one block
//! at a time, accumulating in f32. Rows are independent and large
//! matrices are row-parallelized with rayon; workers join before the
//! kernel returns, so no ordering is observable.

use crate::error::{HablarError, Result};

/// Number of values per quantization block
pub const BLOCK_SIZE: usize = 32;

/// Bytes per Q4_0 block: f16 scale + 16 packed nibble bytes
pub const Q4_0_BLOCK_BYTES: usize = 18;

/// Row count above which matvec kernels parallelize across rows.
///
/// Rayon scheduling overhead dominates for small projections; the
/// break-even sits near 1k rows on current desktop core counts.
const PARALLEL_THRESHOLD: usize = 1024;

/// Minimum rows per rayon work unit
const CHUNK_SIZE: usize = 64;

/// Convert IEEE 754 half-precision (f16) to single-precision (f32)
///
/// Handles normal values, subnormals, infinities, and NaN.
#[inline]
#[must_use]
pub fn f16_to_f32(h: u16) -> f32 {
    let sign = (h >> 15) & 1;
    let exp = (h >> 10) & 0x1F;
    let mantissa = h & 0x3FF;

    let magnitude = if exp == 0 {
        // Subnormal or zero: (mantissa / 1024) * 2^-14
        (f32::from(mantissa) / 1024.0) * (2.0_f32).powi(-14)
    } else if exp == 31 {
        if mantissa == 0 {
            f32::INFINITY
        } else {
            return f32::NAN;
        }
    } else {
        // Normal value: (1 + mantissa/1024) * 2^(exp-15)
        (1.0 + f32::from(mantissa) / 1024.0) * (2.0_f32).powi(i32::from(exp) - 15)
    };

    if sign == 1 {
        -magnitude
    } else {
        magnitude
    }
}

/// Dequantize `Q4_0` format weights
///
/// # Arguments
///
/// * `data` - Raw `Q4_0` quantized data (blocks of scale + 16 bytes)
///
/// # Returns
///
/// Dequantized float32 values, `BLOCK_SIZE` per block
///
/// # Errors
///
/// Returns `InvalidTensor` if data length is not a multiple of the
/// 18-byte block size
pub fn dequantize_q4_0(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % Q4_0_BLOCK_BYTES != 0 {
        return Err(HablarError::InvalidTensor {
            reason: format!(
                "Q4_0 data length {} is not a multiple of block size {}",
                data.len(),
                Q4_0_BLOCK_BYTES
            ),
        });
    }

    let num_blocks = data.len() / Q4_0_BLOCK_BYTES;
    let mut result = vec![0.0f32; num_blocks * BLOCK_SIZE];
    dequantize_q4_0_into(data, &mut result);
    Ok(result)
}

/// Dequantize whole Q4_0 blocks into a pre-allocated buffer.
///
/// `data` must hold complete 18-byte blocks and `out` one f32 slot per
/// packed value; used on the decode hot path (embedding row lookup)
/// where allocation is not allowed.
pub fn dequantize_q4_0_into(data: &[u8], out: &mut [f32]) {
    for (block_idx, block) in data.chunks_exact(Q4_0_BLOCK_BYTES).enumerate() {
        let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();
        let out_block = &mut out[block_idx * BLOCK_SIZE..(block_idx + 1) * BLOCK_SIZE];

        for (j, &byte) in block[2..Q4_0_BLOCK_BYTES].iter().enumerate() {
            // Low nibble -> index j, high nibble -> index j + 16
            let low = i16::from(byte & 0x0F) - 8;
            let high = i16::from(byte >> 4) - 8;
            out_block[j] = scale * f32::from(low);
            out_block[j + 16] = scale * f32::from(high);
        }
    }
}

/// Dequantize `F16` format weights to `F32`
///
/// # Errors
///
/// Returns `InvalidTensor` if data length is not a multiple of 2 bytes
pub fn dequantize_f16(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 2 != 0 {
        return Err(HablarError::InvalidTensor {
            reason: format!("F16 data length {} is not a multiple of 2 bytes", data.len()),
        });
    }

    Ok(data
        .chunks_exact(2)
        .map(|chunk| f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]])))
        .collect())
}

/// Fused Q4_0 row dot product against f32 activations
///
/// Processes one 32-value block at a time: decode the f16 scale, unpack
/// nibbles, multiply-accumulate in f32. The per-block inner sum is kept
/// in f32 and scaled once per block.
#[inline]
#[must_use]
pub fn fused_q4_0_dot(row_data: &[u8], x: &[f32]) -> f32 {
    let mut total = 0.0f32;

    for (block_idx, block) in row_data.chunks_exact(Q4_0_BLOCK_BYTES).enumerate() {
        let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();
        let x_block = &x[block_idx * BLOCK_SIZE..(block_idx + 1) * BLOCK_SIZE];

        let mut block_sum = 0.0f32;
        for (j, &byte) in block[2..Q4_0_BLOCK_BYTES].iter().enumerate() {
            let low = f32::from(i16::from(byte & 0x0F) - 8);
            let high = f32::from(i16::from(byte >> 4) - 8);
            block_sum += low * x_block[j] + high * x_block[j + 16];
        }
        total += scale * block_sum;
    }

    total
}

/// Fused Q4_0 matrix-vector multiply into a pre-allocated buffer
///
/// Computes `out[r] = sum_c W[r, c] * x[c]` for a row-major Q4_0 weight
/// matrix without materializing the dequantized rows. Parallelizes across
/// rows for large matrices; all workers join before returning.
///
/// # Arguments
///
/// * `weight_data` - Q4_0 quantized weight matrix, row-major
/// * `x` - Input activation vector (length `in_dim`)
/// * `in_dim` - Input dimension (columns), must be a multiple of 32
/// * `out` - Pre-allocated output buffer, one slot per row
///
/// # Errors
///
/// Returns `InvalidTensor` if `in_dim` is not a multiple of the block
/// size, the activation length is wrong, or the weight data is too small.
pub fn matvec_q4_0_into(
    weight_data: &[u8],
    x: &[f32],
    in_dim: usize,
    out: &mut [f32],
) -> Result<()> {
    if in_dim % BLOCK_SIZE != 0 {
        return Err(HablarError::InvalidTensor {
            reason: format!("Q4_0 row length {in_dim} is not a multiple of {BLOCK_SIZE}"),
        });
    }
    if x.len() != in_dim {
        return Err(HablarError::InvalidTensor {
            reason: format!("activation length {} does not match in_dim {in_dim}", x.len()),
        });
    }

    let bytes_per_row = (in_dim / BLOCK_SIZE) * Q4_0_BLOCK_BYTES;
    let expected = out.len() * bytes_per_row;
    if weight_data.len() < expected {
        return Err(HablarError::InvalidTensor {
            reason: format!(
                "Q4_0 weight data too small: need {expected} bytes for {}x{in_dim}, have {}",
                out.len(),
                weight_data.len()
            ),
        });
    }

    if out.len() < PARALLEL_THRESHOLD {
        for (r, out_val) in out.iter_mut().enumerate() {
            let row = &weight_data[r * bytes_per_row..(r + 1) * bytes_per_row];
            *out_val = fused_q4_0_dot(row, x);
        }
        return Ok(());
    }

    use rayon::prelude::*;
    out.par_iter_mut()
        .with_min_len(CHUNK_SIZE)
        .enumerate()
        .for_each(|(r, out_val)| {
            let row = &weight_data[r * bytes_per_row..(r + 1) * bytes_per_row];
            *out_val = fused_q4_0_dot(row, x);
        });

    Ok(())
}

/// F32 matrix-vector multiply into a pre-allocated buffer
///
/// # Errors
///
/// Returns `InvalidTensor` on activation / weight size mismatch
pub fn matvec_f32_into(
    weight_data: &[u8],
    x: &[f32],
    in_dim: usize,
    out: &mut [f32],
) -> Result<()> {
    if x.len() != in_dim {
        return Err(HablarError::InvalidTensor {
            reason: format!("activation length {} does not match in_dim {in_dim}", x.len()),
        });
    }
    let bytes_per_row = in_dim * 4;
    if weight_data.len() < out.len() * bytes_per_row {
        return Err(HablarError::InvalidTensor {
            reason: format!(
                "F32 weight data too small: need {} bytes, have {}",
                out.len() * bytes_per_row,
                weight_data.len()
            ),
        });
    }

    let row_dot = |r: usize| -> f32 {
        let row = &weight_data[r * bytes_per_row..(r + 1) * bytes_per_row];
        row.chunks_exact(4)
            .zip(x.iter())
            .map(|(chunk, &xv)| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * xv)
            .sum()
    };

    if out.len() < PARALLEL_THRESHOLD {
        for (r, out_val) in out.iter_mut().enumerate() {
            *out_val = row_dot(r);
        }
        return Ok(());
    }

    use rayon::prelude::*;
    out.par_iter_mut()
        .with_min_len(CHUNK_SIZE)
        .enumerate()
        .for_each(|(r, out_val)| *out_val = row_dot(r));

    Ok(())
}

/// F16 matrix-vector multiply into a pre-allocated buffer
///
/// Reads IEEE-754 binary16 weights (denormals and non-finite values
/// decode per the standard) and accumulates in f32.
///
/// # Errors
///
/// Returns `InvalidTensor` on activation / weight size mismatch
pub fn matvec_f16_into(
    weight_data: &[u8],
    x: &[f32],
    in_dim: usize,
    out: &mut [f32],
) -> Result<()> {
    if x.len() != in_dim {
        return Err(HablarError::InvalidTensor {
            reason: format!("activation length {} does not match in_dim {in_dim}", x.len()),
        });
    }
    let bytes_per_row = in_dim * 2;
    if weight_data.len() < out.len() * bytes_per_row {
        return Err(HablarError::InvalidTensor {
            reason: format!(
                "F16 weight data too small: need {} bytes, have {}",
                out.len() * bytes_per_row,
                weight_data.len()
            ),
        });
    }

    let row_dot = |r: usize| -> f32 {
        let row = &weight_data[r * bytes_per_row..(r + 1) * bytes_per_row];
        row.chunks_exact(2)
            .zip(x.iter())
            .map(|(chunk, &xv)| f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]])) * xv)
            .sum()
    };

    if out.len() < PARALLEL_THRESHOLD {
        for (r, out_val) in out.iter_mut().enumerate() {
            *out_val = row_dot(r);
        }
        return Ok(());
    }

    use rayon::prelude::*;
    out.par_iter_mut()
        .with_min_len(CHUNK_SIZE)
        .enumerate()
        .for_each(|(r, out_val)| *out_val = row_dot(r));

    Ok(())
}

/// Dot product of two f32 slices
#[inline]
#[must_use]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// In-place softmax with max subtraction
///
/// NaN entries are treated as negative infinity so they contribute zero
/// mass instead of poisoning the normalization.
pub fn softmax(scores: &mut [f32]) {
    if scores.is_empty() {
        return;
    }
    for s in scores.iter_mut() {
        if s.is_nan() {
            *s = f32::NEG_INFINITY;
        }
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        // Nothing survivable: fall back to uniform
        let uniform = 1.0 / scores.len() as f32;
        scores.iter_mut().for_each(|s| *s = uniform);
        return;
    }
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    let inv = 1.0 / sum;
    scores.iter_mut().for_each(|s| *s *= inv);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f16_bits(v: f32) -> [u8; 2] {
        half::f16::from_f32(v).to_le_bytes()
    }

    /// Build a single Q4_0 block with the given scale and nibble values
    fn q4_0_block(scale: f32, nibbles: &[u8; 32]) -> Vec<u8> {
        let mut block = Vec::with_capacity(Q4_0_BLOCK_BYTES);
        block.extend_from_slice(&f16_bits(scale));
        for i in 0..16 {
            block.push((nibbles[i] & 0x0F) | (nibbles[i + 16] << 4));
        }
        block
    }

    // ------------------------------------------------------------------------
    // f16 decode
    // ------------------------------------------------------------------------

    #[test]
    fn test_f16_to_f32_normal_values() {
        assert_eq!(f16_to_f32(0x3C00), 1.0);
        assert_eq!(f16_to_f32(0xBC00), -1.0);
        assert_eq!(f16_to_f32(0x4000), 2.0);
        assert_eq!(f16_to_f32(0x3800), 0.5);
    }

    #[test]
    fn test_f16_to_f32_zero_preserves_sign() {
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert_eq!(f16_to_f32(0x8000), -0.0);
        assert!(f16_to_f32(0x8000).is_sign_negative());
    }

    #[test]
    fn test_f16_to_f32_subnormal() {
        // Smallest positive subnormal: 2^-24
        let v = f16_to_f32(0x0001);
        assert!((v - 2.0_f32.powi(-24)).abs() < 1e-10);
    }

    #[test]
    fn test_f16_to_f32_infinity_and_nan() {
        assert_eq!(f16_to_f32(0x7C00), f32::INFINITY);
        assert_eq!(f16_to_f32(0xFC00), f32::NEG_INFINITY);
        assert!(f16_to_f32(0x7C01).is_nan());
    }

    #[test]
    fn test_f16_matches_half_crate() {
        for bits in [0x0000u16, 0x3C00, 0xB800, 0x4248, 0x0010, 0x7BFF] {
            let expected = half::f16::from_bits(bits).to_f32();
            assert_eq!(f16_to_f32(bits), expected, "bits 0x{bits:04X}");
        }
    }

    // ------------------------------------------------------------------------
    // Q4_0 dequantization
    // ------------------------------------------------------------------------

    #[test]
    fn test_dequantize_q4_0_single_block() {
        let mut nibbles = [8u8; 32];
        nibbles[0] = 9; // -> scale * 1
        nibbles[16] = 7; // -> scale * -1
        let block = q4_0_block(2.0, &nibbles);

        let values = dequantize_q4_0(&block).expect("valid block");
        assert_eq!(values.len(), BLOCK_SIZE);
        assert_eq!(values[0], 2.0);
        assert_eq!(values[16], -2.0);
        assert_eq!(values[1], 0.0);
    }

    #[test]
    fn test_dequantize_q4_0_nibble_placement() {
        // Byte i: low nibble -> index i, high nibble -> index i + 16
        let mut nibbles = [8u8; 32];
        nibbles[3] = 15;
        nibbles[19] = 0;
        let block = q4_0_block(1.0, &nibbles);

        let values = dequantize_q4_0(&block).expect("valid block");
        assert_eq!(values[3], 7.0);
        assert_eq!(values[19], -8.0);
    }

    #[test]
    fn test_dequantize_q4_0_invalid_length() {
        let result = dequantize_q4_0(&[0u8; 17]);
        assert!(matches!(result, Err(HablarError::InvalidTensor { .. })));
    }

    #[test]
    fn test_dequantize_q4_0_zero_scale() {
        let block = q4_0_block(0.0, &[15u8; 32]);
        let values = dequantize_q4_0(&block).expect("valid block");
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_dequantize_f16_roundtrip() {
        let mut data = Vec::new();
        for v in [0.0f32, 1.0, -2.5, 0.125] {
            data.extend_from_slice(&f16_bits(v));
        }
        let values = dequantize_f16(&data).expect("valid data");
        assert_eq!(values, vec![0.0, 1.0, -2.5, 0.125]);
    }

    #[test]
    fn test_dequantize_f16_odd_length() {
        assert!(dequantize_f16(&[0u8; 3]).is_err());
    }

    // ------------------------------------------------------------------------
    // Fused matvec
    // ------------------------------------------------------------------------

    #[test]
    fn test_fused_dot_matches_dequantized() {
        let mut nibbles = [0u8; 32];
        for (i, n) in nibbles.iter_mut().enumerate() {
            *n = (i % 16) as u8;
        }
        let row = q4_0_block(0.5, &nibbles);
        let x: Vec<f32> = (0..32).map(|i| i as f32 * 0.1).collect();

        let fused = fused_q4_0_dot(&row, &x);
        let dequant = dequantize_q4_0(&row).expect("valid block");
        let naive = dot_f32(&dequant, &x);
        assert!((fused - naive).abs() < 1e-4, "fused {fused} vs naive {naive}");
    }

    #[test]
    fn test_matvec_q4_0_two_rows() {
        let row0 = q4_0_block(1.0, &{
            let mut n = [8u8; 32];
            n[0] = 9;
            n
        });
        let row1 = q4_0_block(1.0, &{
            let mut n = [8u8; 32];
            n[1] = 10;
            n
        });
        let mut weight = row0;
        weight.extend_from_slice(&row1);

        let mut x = vec![0.0f32; 32];
        x[0] = 3.0;
        x[1] = 5.0;

        let mut out = vec![0.0f32; 2];
        matvec_q4_0_into(&weight, &x, 32, &mut out).expect("valid matvec");
        assert_eq!(out[0], 3.0); // 1 * x[0]
        assert_eq!(out[1], 10.0); // 2 * x[1]
    }

    #[test]
    fn test_matvec_q4_0_rejects_ragged_rows() {
        let result = matvec_q4_0_into(&[0u8; 18], &[0.0; 20], 20, &mut [0.0; 1]);
        assert!(matches!(result, Err(HablarError::InvalidTensor { .. })));
    }

    #[test]
    fn test_matvec_q4_0_rejects_short_weights() {
        let result = matvec_q4_0_into(&[0u8; 18], &[0.0; 32], 32, &mut [0.0; 2]);
        assert!(matches!(result, Err(HablarError::InvalidTensor { .. })));
    }

    #[test]
    fn test_matvec_f32_identity() {
        // 2x3 matrix [[1,0,0],[0,1,0]]
        let mut weight = Vec::new();
        for row in [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            for v in row {
                weight.extend_from_slice(&v.to_le_bytes());
            }
        }
        let mut out = vec![0.0f32; 2];
        matvec_f32_into(&weight, &[7.0, 11.0, 13.0], 3, &mut out).expect("valid matvec");
        assert_eq!(out, vec![7.0, 11.0]);
    }

    #[test]
    fn test_matvec_f16_matches_f32() {
        let values = [0.5f32, -1.0, 2.0, 0.25];
        let mut w16 = Vec::new();
        let mut w32 = Vec::new();
        for v in values {
            w16.extend_from_slice(&f16_bits(v));
            w32.extend_from_slice(&v.to_le_bytes());
        }
        let x = [1.0f32, 2.0, 3.0, 4.0];

        let mut out16 = vec![0.0f32; 1];
        let mut out32 = vec![0.0f32; 1];
        matvec_f16_into(&w16, &x, 4, &mut out16).expect("valid matvec");
        matvec_f32_into(&w32, &x, 4, &mut out32).expect("valid matvec");
        assert!((out16[0] - out32[0]).abs() < 1e-5);
    }

    // ------------------------------------------------------------------------
    // Softmax
    // ------------------------------------------------------------------------

    #[test]
    fn test_softmax_sums_to_one() {
        let mut scores = vec![1.0f32, 2.0, 3.0];
        softmax(&mut scores);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(scores[2] > scores[1] && scores[1] > scores[0]);
    }

    #[test]
    fn test_softmax_nan_excluded() {
        let mut scores = vec![1.0f32, f32::NAN, 1.0];
        softmax(&mut scores);
        assert_eq!(scores[1], 0.0);
        assert!((scores[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_all_nan_falls_back_to_uniform() {
        let mut scores = vec![f32::NAN; 4];
        softmax(&mut scores);
        assert!(scores.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_softmax_empty_is_noop() {
        let mut scores: Vec<f32> = vec![];
        softmax(&mut scores);
        assert!(scores.is_empty());
    }
}
