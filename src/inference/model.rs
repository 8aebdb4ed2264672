//! Model weights and activation state
//!
//! [`LlamaModel`] owns everything the forward pass touches: the
//! dtype-tagged weight registry, the KV cache, and the single-token
//! activation buffers. All buffers are allocated exactly once at load;
//! the per-token path reuses them.

use tracing::info;

use crate::error::{HablarError, Result};
use crate::gguf::{GgufDtype, GgufFile, MappedGgufModel, ModelConfig};
use crate::inference::kv_cache::KvCache;
use crate::quantize::{
    dequantize_f16, dequantize_q4_0, dequantize_q4_0_into, f16_to_f32, matvec_f16_into,
    matvec_f32_into, matvec_q4_0_into,
};

/// A weight matrix in its on-disk encoding
///
/// Rows stay quantized; the matvec kernels fuse dequantization with the
/// inner product, so the full f32 matrix never exists in memory.
#[derive(Debug, Clone)]
pub struct QuantTensor {
    /// Storage format
    pub dtype: GgufDtype,
    /// Raw row-major tensor bytes (owned copy of the mapped region)
    pub data: Vec<u8>,
    /// Output dimension
    pub rows: usize,
    /// Input dimension
    pub cols: usize,
}

impl QuantTensor {
    /// Load a 2-D tensor and validate its shape
    ///
    /// # Errors
    ///
    /// `MissingTensor` when absent, `ShapeMismatch` on a wrong shape,
    /// `InvalidTensor` on unsupported dtype or malformed rows.
    pub fn load(
        file: &GgufFile,
        file_data: &[u8],
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Self> {
        let info = file
            .find_tensor(name)
            .ok_or_else(|| HablarError::MissingTensor {
                name: name.to_string(),
            })?;

        let actual: Vec<usize> = info
            .dims
            .iter()
            .map(|&d| usize::try_from(d).unwrap_or(usize::MAX))
            .collect();
        if actual != [rows, cols] {
            return Err(HablarError::ShapeMismatch {
                name: name.to_string(),
                expected: vec![rows, cols],
                actual,
            });
        }

        let dtype = GgufDtype::from_code(info.dtype)?;
        // Validates Q4_0 divisibility as a side effect
        dtype.row_bytes(cols)?;
        let bytes = file.tensor_bytes(info, file_data)?;

        Ok(Self {
            dtype,
            data: bytes.to_vec(),
            rows,
            cols,
        })
    }

    /// Fused matrix-vector multiply: `out[r] = sum_c W[r,c] * x[c]`
    ///
    /// # Errors
    ///
    /// Propagates kernel shape errors; impossible after load validation.
    pub fn matvec_into(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        match self.dtype {
            GgufDtype::Q4_0 => matvec_q4_0_into(&self.data, x, self.cols, out),
            GgufDtype::F16 => matvec_f16_into(&self.data, x, self.cols, out),
            GgufDtype::F32 => matvec_f32_into(&self.data, x, self.cols, out),
        }
    }

    /// Dequantize one row into a pre-allocated buffer (embedding lookup)
    pub fn dequantize_row_into(&self, row: usize, out: &mut [f32]) {
        match self.dtype {
            GgufDtype::Q4_0 => {
                let row_bytes = self.cols / crate::quantize::BLOCK_SIZE
                    * crate::quantize::Q4_0_BLOCK_BYTES;
                let start = row * row_bytes;
                dequantize_q4_0_into(&self.data[start..start + row_bytes], out);
            },
            GgufDtype::F16 => {
                let start = row * self.cols * 2;
                for (i, chunk) in self.data[start..start + self.cols * 2]
                    .chunks_exact(2)
                    .enumerate()
                {
                    out[i] = f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
                }
            },
            GgufDtype::F32 => {
                let start = row * self.cols * 4;
                for (i, chunk) in self.data[start..start + self.cols * 4]
                    .chunks_exact(4)
                    .enumerate()
                {
                    out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            },
        }
    }
}

/// Load a 1-D tensor dequantized to f32 (norm gains, biases)
fn load_vector(file: &GgufFile, file_data: &[u8], name: &str, len: usize) -> Result<Vec<f32>> {
    let info = file
        .find_tensor(name)
        .ok_or_else(|| HablarError::MissingTensor {
            name: name.to_string(),
        })?;

    let actual: Vec<usize> = info
        .dims
        .iter()
        .map(|&d| usize::try_from(d).unwrap_or(usize::MAX))
        .collect();
    if actual != [len] {
        return Err(HablarError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![len],
            actual,
        });
    }

    let bytes = file.tensor_bytes(info, file_data)?;
    match GgufDtype::from_code(info.dtype)? {
        GgufDtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        GgufDtype::F16 => dequantize_f16(bytes),
        GgufDtype::Q4_0 => {
            let mut values = dequantize_q4_0(bytes)?;
            values.truncate(len);
            Ok(values)
        },
    }
}

/// Optional 1-D tensor: `None` when absent, error on wrong shape
fn load_vector_opt(
    file: &GgufFile,
    file_data: &[u8],
    name: &str,
    len: usize,
) -> Result<Option<Vec<f32>>> {
    if file.find_tensor(name).is_none() {
        return Ok(None);
    }
    load_vector(file, file_data, name, len).map(Some)
}

/// Weights for one decoder layer

#[derive(Debug)]
pub struct LayerWeights {
    /// Input RMSNorm gain [D]
    pub attn_norm: Vec<f32>,
    /// Query projection [D, D]
    pub wq: QuantTensor,
    /// Key projection [kv_dim, D]
    pub wk: QuantTensor,
    /// Value projection [kv_dim, D]
    pub wv: QuantTensor,
    /// Attention output projection [D, D]
    pub wo: QuantTensor,
    /// Optional query bias [D]
    pub bq: Option<Vec<f32>>,
    /// Optional key bias [kv_dim]
    pub bk: Option<Vec<f32>>,
    /// Optional value bias [kv_dim]
    pub bv: Option<Vec<f32>>,
    /// Post-attention RMSNorm gain [D]
    pub ffn_norm: Vec<f32>,
    /// SwiGLU gate projection [M, D]
    pub w_gate: QuantTensor,
    /// SwiGLU up projection [M, D]
    pub w_up: QuantTensor,
    /// SwiGLU down projection [D, M]
    pub w_down: QuantTensor,
}

/// Single-token activation buffers, reused across tokens

#[derive(Debug)]
pub(crate) struct ActivationState {
    /// Residual stream [D]
    pub x: Vec<f32>,
    /// Normed activations [D]
    pub xb: Vec<f32>,
    /// Projection scratch [D]
    pub xb2: Vec<f32>,
    /// MLP gate activations [M]
    pub hb: Vec<f32>,
    /// MLP up activations [M]
    pub hb2: Vec<f32>,
    /// Query vector [D]
    pub q: Vec<f32>,
    /// Key vector [kv_dim]
    pub k: Vec<f32>,
    /// Value vector [kv_dim]
    pub v: Vec<f32>,
    /// Attention scores [H * max_seq_len]
    pub att: Vec<f32>,
    /// Output logits [V]
    pub logits: Vec<f32>,
}

impl ActivationState {
    pub(crate) fn new(config: &ModelConfig) -> Self {
        Self {
            x: vec![0.0; config.hidden_dim],
            xb: vec![0.0; config.hidden_dim],
            xb2: vec![0.0; config.hidden_dim],
            hb: vec![0.0; config.ffn_dim],
            hb2: vec![0.0; config.ffn_dim],
            q: vec![0.0; config.hidden_dim],
            k: vec![0.0; config.kv_dim()],
            v: vec![0.0; config.kv_dim()],
            att: vec![0.0; config.num_heads * config.seq_len],
            logits: vec![0.0; config.vocab_size],
        }
    }
}

/// A loaded llama-family model: weights, KV cache, activation buffers
#[derive(Debug)]
pub struct LlamaModel {
    /// Hyperparameters
    pub config: ModelConfig,
    /// Token embedding [V, D]
    pub(crate) token_embedding: QuantTensor,
    /// Decoder layers
    pub(crate) layers: Vec<LayerWeights>,
    /// Final RMSNorm gain [D]
    pub(crate) final_norm: Vec<f32>,
    /// Output projection [V, D]; `None` when tied to the embedding
    pub(crate) output: Option<QuantTensor>,
    /// Key/value history
    pub(crate) kv_cache: KvCache,
    /// Reused per-token buffers
    pub(crate) state: ActivationState,
}

impl LlamaModel {
    /// Load weights from a mapped container
    ///
    /// `max_context` caps the context window (and with it the KV cache
    /// allocation) below the model's declared maximum.
    ///
    /// # Errors
    ///
    /// All load-time error kinds: container, architecture, missing
    /// tensors, shape mismatches, invalid tensor data.
    pub fn load(mapped: &MappedGgufModel, max_context: Option<usize>) -> Result<Self> {
        let config = ModelConfig::from_gguf(&mapped.file, max_context)?;
        let file = &mapped.file;
        let data = mapped.data();

        let dim = config.hidden_dim;
        let kv_dim = config.kv_dim();
        let ffn = config.ffn_dim;
        let vocab = config.vocab_size;

        let token_embedding = QuantTensor::load(file, data, "token_embd.weight", vocab, dim)?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let p = format!("blk.{i}");
            layers.push(LayerWeights {
                attn_norm: load_vector(file, data, &format!("{p}.attn_norm.weight"), dim)?,
                wq: QuantTensor::load(file, data, &format!("{p}.attn_q.weight"), dim, dim)?,
                wk: QuantTensor::load(file, data, &format!("{p}.attn_k.weight"), kv_dim, dim)?,
                wv: QuantTensor::load(file, data, &format!("{p}.attn_v.weight"), kv_dim, dim)?,
                wo: QuantTensor::load(file, data, &format!("{p}.attn_output.weight"), dim, dim)?,
                bq: load_vector_opt(file, data, &format!("{p}.attn_q.bias"), dim)?,
                bk: load_vector_opt(file, data, &format!("{p}.attn_k.bias"), kv_dim)?,
                bv: load_vector_opt(file, data, &format!("{p}.attn_v.bias"), kv_dim)?,
                ffn_norm: load_vector(file, data, &format!("{p}.ffn_norm.weight"), dim)?,
                w_gate: QuantTensor::load(file, data, &format!("{p}.ffn_gate.weight"), ffn, dim)?,
                w_up: QuantTensor::load(file, data, &format!("{p}.ffn_up.weight"), ffn, dim)?,
                w_down: QuantTensor::load(file, data, &format!("{p}.ffn_down.weight"), dim, ffn)?,
            });
        }

        let final_norm = load_vector(file, data, "output_norm.weight", dim)?;

        // Tied embeddings: a missing output projection aliases the token
        // embedding matrix.
        let output = if file.find_tensor("output.weight").is_some() {
            Some(QuantTensor::load(file, data, "output.weight", vocab, dim)?)
        } else {
            None
        };

        // The RoPE rotation scratch holds up to 128 pair frequencies
        if config.head_dim / 2 > 128 {
            return Err(HablarError::AllocationFailure {
                reason: format!(
                    "head dimension {} exceeds the 256 the rotation scratch covers",
                    config.head_dim
                ),
            });
        }

        let kv_cache = KvCache::new(config.num_layers, kv_dim, config.seq_len);
        let state = ActivationState::new(&config);

        info!(
            tied_output = output.is_none(),
            layers = layers.len(),
            "model weights loaded"
        );

        Ok(Self {
            config,
            token_embedding,
            layers,
            final_norm,
            output,
            kv_cache,
            state,
        })
    }

    /// Logit vector produced by the last forward call
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    /// Mutable logits, for sampler-side penalty application
    pub fn logits_mut(&mut self) -> &mut [f32] {
        &mut self.state.logits
    }

    /// Current sequence length (positions filled in the KV cache)
    #[must_use]
    pub fn cur_pos(&self) -> usize {
        self.kv_cache.len()
    }

    /// Clear the KV cache without freeing it
    pub fn reset(&mut self) {
        self.kv_cache.reset();
    }
}
