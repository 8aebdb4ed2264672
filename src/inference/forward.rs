//! Per-token transformer forward pass
//!
//! One invocation advances the model by exactly one token at position
//! `pos`: embedding lookup, N decoder blocks (RMSNorm -> GQA attention
//! with RoPE -> residual -> RMSNorm -> SwiGLU -> residual), final norm,
//! output projection into the shared logits buffer.
//!
//! The pass is deterministic given cache state and allocates nothing;
//! every buffer it writes was provisioned at load.

use crate::error::Result;
use crate::inference::model::LlamaModel;
use crate::quantize::{dot_f32, softmax};

/// RMSNorm: `out[i] = x[i] * rsqrt(mean(x^2) + eps) * gain[i]`
pub(crate) fn rmsnorm_into(out: &mut [f32], x: &[f32], gain: &[f32], eps: f32) {
    #[allow(clippy::cast_precision_loss)]
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (mean_sq + eps).sqrt();
    for ((o, &xi), &g) in out.iter_mut().zip(x.iter()).zip(gain.iter()) {
        *o = xi * inv * g;
    }
}

/// SiLU activation: `z / (1 + e^-z)`
#[inline]
pub(crate) fn silu(z: f32) -> f32 {
    z / (1.0 + (-z).exp())
}

/// Rotate query/key pairs by position-dependent angles.
///
/// NORM-style RoPE over adjacent pairs, the llama-family convention:
/// pair `j` of every head rotates by `pos * theta^(-2j / head_dim)`.
pub(crate) fn apply_rope(x: &mut [f32], pos: usize, num_heads: usize, head_dim: usize, theta: f32) {
    let half = head_dim / 2;

    // Angles depend only on the pair index; compute once, reuse per head.
    // 128 pairs covers every supported head dimension (validated at load).
    let mut cos_vals = [0.0f32; 128];
    let mut sin_vals = [0.0f32; 128];
    #[allow(clippy::cast_precision_loss)]
    for (j, (c, s)) in cos_vals.iter_mut().zip(sin_vals.iter_mut()).enumerate().take(half) {
        let freq = theta.powf(-2.0 * j as f32 / head_dim as f32);
        let angle = pos as f32 * freq;
        let (sin_v, cos_v) = angle.sin_cos();
        *c = cos_v;
        *s = sin_v;
    }

    for h in 0..num_heads {
        let head = &mut x[h * head_dim..(h + 1) * head_dim];
        for j in 0..half {
            let x0 = head[2 * j];
            let x1 = head[2 * j + 1];
            head[2 * j] = x0 * cos_vals[j] - x1 * sin_vals[j];
            head[2 * j + 1] = x0 * sin_vals[j] + x1 * cos_vals[j];
        }
    }
}

fn add_bias(x: &mut [f32], bias: Option<&[f32]>) {
    if let Some(b) = bias {
        for (xi, bi) in x.iter_mut().zip(b.iter()) {
            *xi += bi;
        }
    }
}

impl LlamaModel {
    /// Advance the model by one token at position `pos`.
    ///
    /// Fills KV cache slot `[layer, pos]` for every layer and overwrites
    /// the logits buffer. Out-of-range token ids fall back to embedding
    /// row 0. Position bounding is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Propagates kernel shape errors; load-time validation makes these
    /// unreachable for a successfully loaded model.
    pub fn forward(&mut self, token: u32, pos: usize) -> Result<()> {
        let config = &self.config;
        let state = &mut self.state;
        let kv_cache = &mut self.kv_cache;

        let dim = config.hidden_dim;
        let head_dim = config.head_dim;
        let kv_dim = config.kv_dim();
        let num_heads = config.num_heads;
        let group_size = config.num_heads / config.num_kv_heads;
        let seq_len = config.seq_len;
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim as f32).sqrt();

        let row = if (token as usize) < config.vocab_size {
            token as usize
        } else {
            0
        };
        self.token_embedding.dequantize_row_into(row, &mut state.x);

        let attend_len = (pos + 1).min(seq_len);

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            // Attention block
            rmsnorm_into(&mut state.xb, &state.x, &layer.attn_norm, config.rms_eps);

            layer.wq.matvec_into(&state.xb, &mut state.q)?;
            layer.wk.matvec_into(&state.xb, &mut state.k)?;
            layer.wv.matvec_into(&state.xb, &mut state.v)?;
            add_bias(&mut state.q, layer.bq.as_deref());
            add_bias(&mut state.k, layer.bk.as_deref());
            add_bias(&mut state.v, layer.bv.as_deref());

            apply_rope(&mut state.q, pos, num_heads, head_dim, config.rope_theta);
            apply_rope(&mut state.k, pos, config.num_kv_heads, head_dim, config.rope_theta);

            // Slot p is written before any read at >= p
            kv_cache.store(layer_idx, pos, &state.k, &state.v);

            let keys = kv_cache.k_prefix(layer_idx, attend_len);
            let values = kv_cache.v_prefix(layer_idx, attend_len);

            for h in 0..num_heads {
                // Canonical grouped-query mapping: h_kv = h / (H / Hk)
                let kv_head_offset = (h / group_size) * head_dim;
                let q_head = &state.q[h * head_dim..(h + 1) * head_dim];
                let att = &mut state.att[h * seq_len..h * seq_len + attend_len];

                for (i, score) in att.iter_mut().enumerate() {
                    let k_row = &keys[i * kv_dim + kv_head_offset..][..head_dim];
                    *score = dot_f32(q_head, k_row) * scale;
                }
                softmax(att);

                let out_head = &mut state.xb[h * head_dim..(h + 1) * head_dim];
                out_head.fill(0.0);
                for (i, &weight) in att.iter().enumerate() {
                    let v_row = &values[i * kv_dim + kv_head_offset..][..head_dim];
                    for (o, &vd) in out_head.iter_mut().zip(v_row.iter()) {
                        *o += weight * vd;
                    }
                }
            }

            layer.wo.matvec_into(&state.xb, &mut state.xb2)?;
            for (xi, &delta) in state.x.iter_mut().zip(state.xb2.iter()).take(dim) {
                *xi += delta;
            }

            // SwiGLU MLP block
            rmsnorm_into(&mut state.xb, &state.x, &layer.ffn_norm, config.rms_eps);
            layer.w_gate.matvec_into(&state.xb, &mut state.hb)?;
            layer.w_up.matvec_into(&state.xb, &mut state.hb2)?;
            for (g, &u) in state.hb.iter_mut().zip(state.hb2.iter()) {
                *g = silu(*g) * u;
            }
            layer.w_down.matvec_into(&state.hb, &mut state.xb2)?;
            for (xi, &delta) in state.x.iter_mut().zip(state.xb2.iter()).take(dim) {
                *xi += delta;
            }
        }

        rmsnorm_into(&mut state.xb, &state.x, &self.final_norm, config.rms_eps);

        let output = self.output.as_ref().unwrap_or(&self.token_embedding);
        output.matvec_into(&state.xb, &mut state.logits)?;

        kv_cache.mark_filled(pos);
        Ok(())
    }
}
