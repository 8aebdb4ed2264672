//! Autoregressive generation loop
//!
//! Prefill the prompt through the transformer, then decode one token at
//! a time: penalties over a sliding window, top-p or top-k sampling at a
//! floored temperature, and the stop conditions in priority order (EOS,
//! token cycle, wide-codepoint drift, sequence cap). After `max_tokens`
//! the loop enters a bounded grace period and stops at the first
//! sentence boundary.

use rand::Rng;
use tracing::debug;

use crate::error::Result;
use crate::inference::LlamaModel;
use crate::sampling::{
    apply_frequency_penalty, apply_repetition_penalty, sample_top_k, sample_top_p, RecentWindow,
    SampleBuffers,
};
use crate::tokenizer::Tokenizer;

/// Extra iterations allowed past `max_tokens` to finish a sentence
const GRACE_LIMIT: usize = 32;

/// Emitted tokens required before the drift guard may fire
const DRIFT_WARMUP: usize = 5;

/// Sampler tuning shared across generations
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerOptions {
    /// Lower bound applied to the requested temperature
    pub temp_floor: f32,
    /// Repetition penalty rho; values <= 1 disable it
    pub rep_penalty: f32,
    /// Sliding-window capacity for both penalties
    pub rep_window: usize,
    /// Frequency penalty phi; 0 disables it
    pub freq_penalty: f32,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            temp_floor: 0.9,
            rep_penalty: 1.15,
            rep_window: 64,
            freq_penalty: 0.0,
        }
    }
}

/// Per-call generation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Token budget before the grace period starts
    pub max_tokens: usize,
    /// Sampling temperature (floored by [`SamplerOptions::temp_floor`])
    pub temperature: f32,
    /// Nucleus cutoff; >= 1.0 switches to top-k sampling
    pub top_p: f32,
    /// Optional system/anchor prompt encoded ahead of the user prompt
    pub anchor: Option<String>,
    /// Output byte budget
    pub max_output_bytes: usize,
    /// Stop when a wide (3+ byte UTF-8) codepoint appears after warmup.
    /// Product heuristic for models tuned on ASCII-heavy data; default on.
    pub drift_guard: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 1.0,
            top_p: 1.0,
            anchor: None,
            max_output_bytes: 2048,
            drift_guard: true,
        }
    }
}

impl GenerationConfig {
    /// Set the token budget
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the nucleus cutoff
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the anchor prompt
    #[must_use]
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = Some(anchor.into());
        self
    }

    /// Set the output byte budget
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Enable or disable the drift guard
    #[must_use]
    pub fn with_drift_guard(mut self, drift_guard: bool) -> Self {
        self.drift_guard = drift_guard;
        self
    }
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Decoded output (lossily finalized from the emitted bytes)
    pub text: String,
    /// Number of tokens emitted (EOS excluded)
    pub token_count: usize,
}

/// Run one blocking generation to completion or early stop.
///
/// The model is reset first, so every call starts from the Empty cache
/// state; a fixed RNG seed makes the token sequence a pure function of
/// the inputs.
///
/// # Errors
///
/// Propagates forward-pass errors; unreachable for a validated model.
pub fn generate<R: Rng>(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    sampler: &SamplerOptions,
    buffers: &mut SampleBuffers,
    rng: &mut R,
    prompt: &str,
    config: &GenerationConfig,
) -> Result<Generation> {
    let seq_len = model.config.seq_len;

    // BOS only when it differs from EOS: GPT-2-style vocabularies alias
    // the two, and those models were not trained with a leading BOS.
    let mut all_tokens: Vec<u32> = Vec::new();
    if tokenizer.bos_id >= 0 && tokenizer.bos_id != tokenizer.eos_id {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        all_tokens.push(tokenizer.bos_id as u32);
    }
    if let Some(anchor) = config.anchor.as_deref() {
        if !anchor.is_empty() {
            all_tokens.extend(tokenizer.encode(anchor, false));
        }
    }
    all_tokens.extend(tokenizer.encode(prompt, false));
    all_tokens.truncate(seq_len.saturating_sub(1));

    model.reset();
    let mut pos = 0usize;
    for &tok in &all_tokens {
        model.forward(tok, pos)?;
        pos += 1;
    }

    let temp = config.temperature.max(sampler.temp_floor);
    let mut window = RecentWindow::new(sampler.rep_window);
    let mut output: Vec<u8> = Vec::with_capacity(config.max_output_bytes.min(4096));
    let mut gen_count = 0usize;
    let mut in_grace = false;

    let mut i = 0usize;
    while i < config.max_tokens + GRACE_LIMIT && output.len() < config.max_output_bytes {
        if i >= config.max_tokens {
            in_grace = true;
        }
        if in_grace {
            if let Some(&last) = output.last() {
                if matches!(last, b'.' | b'!' | b'?' | b'\n') {
                    break;
                }
            }
        }

        {
            let logits = model.logits_mut();
            apply_repetition_penalty(logits, &window, sampler.rep_penalty);
            apply_frequency_penalty(logits, &window, sampler.freq_penalty);
        }

        let next = if config.top_p < 1.0 {
            sample_top_p(model.logits(), temp, config.top_p, rng, buffers)
        } else {
            sample_top_k(model.logits(), temp, rng, buffers)
        };

        window.push(next);

        if i64::from(next) == tokenizer.eos_id {
            break;
        }
        if window.is_cycle() {
            debug!(token = next, "token cycle detected, stopping");
            break;
        }

        let piece = tokenizer.decode_token(next);
        // A first byte >= 0xE0 starts a 3+ byte UTF-8 sequence; in the
        // target models that is drift away from the tuned distribution.
        if config.drift_guard && gen_count > DRIFT_WARMUP && piece.iter().any(|&b| b >= 0xE0) {
            debug!(token = next, "wide codepoint after warmup, stopping");
            break;
        }

        output.extend_from_slice(&piece);
        model.forward(next, pos)?;
        pos += 1;
        gen_count += 1;

        if pos >= seq_len {
            break;
        }
        i += 1;
    }

    output.truncate(config.max_output_bytes);
    Ok(Generation {
        text: String::from_utf8_lossy(&output).into_owned(),
        token_count: gen_count,
    })
}
