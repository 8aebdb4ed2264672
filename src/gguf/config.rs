//! Model hyperparameters extracted from GGUF metadata

use tracing::info;

use crate::error::{HablarError, Result};
use crate::gguf::loader::GgufFile;

/// Architectures this engine can run.
///
/// `qwen2` shares the llama block layout (RMSNorm / GQA+RoPE / SwiGLU)
/// and differs only in carrying Q/K/V projection biases.
const SUPPORTED_ARCHITECTURES: [&str; 2] = ["llama", "qwen2"];

/// Default RoPE frequency base when `rope.freq_base` is absent
const DEFAULT_ROPE_THETA: f32 = 10_000.0;

/// Default RMSNorm epsilon when `layer_norm_rms_epsilon` is absent
const DEFAULT_RMS_EPS: f32 = 1e-5;

/// Immutable model hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Architecture string from the container
    pub architecture: String,
    /// Vocabulary size V
    pub vocab_size: usize,
    /// Embedding dimension D
    pub hidden_dim: usize,
    /// Number of decoder layers L
    pub num_layers: usize,
    /// Number of attention heads H
    pub num_heads: usize,
    /// Number of key/value heads Hk (grouped-query attention when < H)
    pub num_kv_heads: usize,
    /// Per-head dimension D / H
    pub head_dim: usize,
    /// MLP intermediate dimension M
    pub ffn_dim: usize,
    /// Maximum sequence length (context window, possibly caller-capped)
    pub seq_len: usize,
    /// RoPE frequency base theta
    pub rope_theta: f32,
    /// RMSNorm epsilon
    pub rms_eps: f32,
}

impl ModelConfig {
    /// Extract hyperparameters from a parsed container
    ///
    /// `max_context` caps the declared context length; the KV cache is
    /// sized from the capped value.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchitecture` for anything outside the llama
    /// family and `InvalidContainer` when required keys are missing or
    /// inconsistent.
    pub fn from_gguf(file: &GgufFile, max_context: Option<usize>) -> Result<Self> {
        let arch = file
            .architecture()
            .ok_or_else(|| HablarError::InvalidContainer {
                reason: "missing general.architecture".to_string(),
            })?
            .to_string();
        if !SUPPORTED_ARCHITECTURES.contains(&arch.as_str()) {
            return Err(HablarError::UnsupportedArchitecture { arch });
        }

        let required = |suffix: &str| -> Result<usize> {
            file.arch_u64(suffix)
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| HablarError::InvalidContainer {
                    reason: format!("missing {arch}.{suffix}"),
                })
        };

        let hidden_dim = required("embedding_length")?;
        let num_layers = required("block_count")?;
        let num_heads = required("attention.head_count")?;
        let ffn_dim = required("feed_forward_length")?;
        let context_length = required("context_length")?;
        let num_kv_heads = file
            .arch_u64("attention.head_count_kv")
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(num_heads);

        if num_heads == 0 || hidden_dim % num_heads != 0 {
            return Err(HablarError::InvalidContainer {
                reason: format!(
                    "embedding_length {hidden_dim} not divisible by head_count {num_heads}"
                ),
            });
        }
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(HablarError::InvalidContainer {
                reason: format!(
                    "head_count {num_heads} not divisible by head_count_kv {num_kv_heads}"
                ),
            });
        }

        // Vocabulary size is not always present as a scalar key; fall back
        // to the tokenizer vocabulary, then to the embedding tensor shape.
        let vocab_size = file
            .arch_u64("vocab_size")
            .and_then(|v| usize::try_from(v).ok())
            .or_else(|| file.token_list().map(|t| t.len()))
            .or_else(|| {
                file.find_tensor("token_embd.weight")
                    .and_then(|t| t.dims.first())
                    .and_then(|&d| usize::try_from(d).ok())
            })
            .ok_or_else(|| HablarError::InvalidContainer {
                reason: "cannot determine vocabulary size".to_string(),
            })?;

        let seq_len = match max_context {
            Some(cap) if cap > 0 => context_length.min(cap),
            _ => context_length,
        };

        let config = Self {
            architecture: arch,
            vocab_size,
            hidden_dim,
            num_layers,
            num_heads,
            num_kv_heads,
            head_dim: hidden_dim / num_heads,
            ffn_dim,
            seq_len,
            rope_theta: file.arch_f32("rope.freq_base").unwrap_or(DEFAULT_ROPE_THETA),
            rms_eps: file
                .arch_f32("attention.layer_norm_rms_epsilon")
                .unwrap_or(DEFAULT_RMS_EPS),
        };

        info!(
            arch = %config.architecture,
            layers = config.num_layers,
            dim = config.hidden_dim,
            heads = config.num_heads,
            kv_heads = config.num_kv_heads,
            vocab = config.vocab_size,
            seq_len = config.seq_len,
            "model configuration"
        );

        Ok(config)
    }

    /// Key/value projection width Hk * head_dim
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}
