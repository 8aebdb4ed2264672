//! Property-based tests for the quantized kernels
//!
//! The central contract: the fused Q4_0 matvec equals naive
//! dequantize-then-multiply within a norm-scaled tolerance, for any
//! well-formed block data.

use proptest::prelude::*;

use hablar::quantize::{
    dequantize_f16, dequantize_q4_0, dot_f32, f16_to_f32, fused_q4_0_dot, matvec_q4_0_into,
    softmax, BLOCK_SIZE, Q4_0_BLOCK_BYTES,
};

/// A Q4_0 block with a finite, sane scale
fn q4_0_block_strategy() -> impl Strategy<Value = Vec<u8>> {
    (-4.0f32..4.0, prop::collection::vec(any::<u8>(), 16..=16)).prop_map(|(scale, quants)| {
        let mut block = Vec::with_capacity(Q4_0_BLOCK_BYTES);
        block.extend_from_slice(&half::f16::from_f32(scale).to_le_bytes());
        block.extend(quants);
        block
    })
}

/// A Q4_0 row of 1..=8 blocks
fn q4_0_row_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(q4_0_block_strategy(), 1..=8).prop_map(|blocks| blocks.concat())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Dequantization produces exactly BLOCK_SIZE values per block
    #[test]
    fn prop_q4_0_output_size(row in q4_0_row_strategy()) {
        let values = dequantize_q4_0(&row).expect("well-formed row");
        prop_assert_eq!(values.len(), row.len() / Q4_0_BLOCK_BYTES * BLOCK_SIZE);
    }

    /// Every dequantized value is scale * n with n in [-8, 7]
    #[test]
    fn prop_q4_0_value_range(block in q4_0_block_strategy()) {
        let scale = f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let values = dequantize_q4_0(&block).expect("well-formed block");
        for v in values {
            prop_assert!(v.abs() <= scale.abs() * 8.0 + 1e-6);
        }
    }

    /// Fused dot product equals dequantize-then-dot within
    /// 1e-4 * ||W||_F * ||x||_inf
    #[test]
    fn prop_fused_dot_matches_naive(row in q4_0_row_strategy()) {
        let cols = row.len() / Q4_0_BLOCK_BYTES * BLOCK_SIZE;
        // Deterministic activations derived from the row bytes
        let x: Vec<f32> = (0..cols)
            .map(|i| (f32::from(row[i % row.len()]) - 127.5) / 64.0)
            .collect();

        let fused = fused_q4_0_dot(&row, &x);
        let dequant = dequantize_q4_0(&row).expect("well-formed row");
        let naive = dot_f32(&dequant, &x);

        let frob: f32 = dequant.iter().map(|w| w * w).sum::<f32>().sqrt();
        let x_inf = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let tol = 1e-4 * frob * x_inf + 1e-6;
        prop_assert!(
            (fused - naive).abs() <= tol,
            "fused {} vs naive {} tol {}",
            fused, naive, tol
        );
    }

    /// The row-parallel matvec agrees with per-row fused dots
    #[test]
    fn prop_matvec_matches_row_dots(
        rows in prop::collection::vec(q4_0_block_strategy(), 2..=6),
    ) {
        let weight: Vec<u8> = rows.concat();
        let x: Vec<f32> = (0..BLOCK_SIZE).map(|i| (i as f32 - 16.0) * 0.1).collect();

        let mut out = vec![0.0f32; rows.len()];
        matvec_q4_0_into(&weight, &x, BLOCK_SIZE, &mut out).expect("valid shapes");

        for (r, row) in rows.iter().enumerate() {
            let expected = fused_q4_0_dot(row, &x);
            prop_assert!((out[r] - expected).abs() < 1e-5);
        }
    }

    /// Lengths that are not whole blocks always error
    #[test]
    fn prop_ragged_length_errors(len in 1usize..200) {
        prop_assume!(len % Q4_0_BLOCK_BYTES != 0);
        prop_assert!(dequantize_q4_0(&vec![0u8; len]).is_err());
    }

    /// f16 decoding round-trips through the half crate for finite values
    #[test]
    fn prop_f16_matches_half_crate(bits in any::<u16>()) {
        let ours = f16_to_f32(bits);
        let reference = half::f16::from_bits(bits).to_f32();
        if reference.is_nan() {
            prop_assert!(ours.is_nan());
        } else {
            prop_assert_eq!(ours, reference);
        }
    }

    /// F16 buffers decode element-wise
    #[test]
    fn prop_f16_buffer_roundtrip(values in prop::collection::vec(-100.0f32..100.0, 1..32)) {
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let decoded = dequantize_f16(&bytes).expect("even length");
        for (d, v) in decoded.iter().zip(values.iter()) {
            // f16 has ~3 decimal digits of precision
            prop_assert!((d - v).abs() <= v.abs() * 1e-2 + 1e-2);
        }
    }

    /// Softmax output is a probability distribution
    #[test]
    fn prop_softmax_distribution(mut scores in prop::collection::vec(-50.0f32..50.0, 1..64)) {
        softmax(&mut scores);
        let sum: f32 = scores.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-4);
        prop_assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }
}
