//! Inference engine facade
//!
//! [`Engine`] ties the loaded model, tokenizer, sampler state, and RNG
//! into one owned value. All mutable state (KV cache, activation
//! buffers, sampling scratch) lives inside, so `&mut self` gives the
//! exclusive access the forward pass requires; the `shared` module wraps
//! one instance behind a process-wide mutex for callers that want the
//! singleton contract.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::error::Result;
use crate::generate::{generate, Generation, GenerationConfig, SamplerOptions};
use crate::gguf::MappedGgufModel;
use crate::inference::LlamaModel;
use crate::sampling::SampleBuffers;
use crate::tokenizer::Tokenizer;

/// A fully loaded inference engine
#[derive(Debug)]
pub struct Engine {
    model: LlamaModel,
    tokenizer: Tokenizer,
    sampler: SamplerOptions,
    buffers: SampleBuffers,
    rng: StdRng,
}

impl Engine {
    /// Load a GGUF model and build the tokenizer from its metadata
    ///
    /// # Errors
    ///
    /// Any load-time error: I/O, container, architecture, tensor
    /// validation, vocabulary assembly.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_context(path, None)
    }

    /// Load with the context window capped at `max_context` positions
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Engine::load`].
    pub fn load_with_context<P: AsRef<Path>>(path: P, max_context: Option<usize>) -> Result<Self> {
        let mapped = MappedGgufModel::from_path(path.as_ref())?;
        let model = LlamaModel::load(&mapped, max_context)?;
        let tokenizer = Tokenizer::from_gguf(&mapped.file)?;
        let buffers = SampleBuffers::new(model.config.vocab_size);

        info!(
            path = %path.as_ref().display(),
            vocab = model.config.vocab_size,
            dim = model.config.hidden_dim,
            seq_len = model.config.seq_len,
            "engine initialized"
        );

        Ok(Self {
            model,
            tokenizer,
            sampler: SamplerOptions::default(),
            buffers,
            rng: StdRng::from_entropy(),
        })
    }

    /// Clear the KV cache; the next generation starts from scratch
    pub fn reset(&mut self) {
        self.model.reset();
    }

    /// Reseed the sampler RNG. With a fixed seed the generated token
    /// sequence is a pure function of the inputs.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Set the temperature floor
    pub fn set_temp_floor(&mut self, floor: f32) {
        self.sampler.temp_floor = floor;
    }

    /// Set the repetition penalty and its window capacity
    pub fn set_rep_penalty(&mut self, penalty: f32, window: usize) {
        self.sampler.rep_penalty = penalty;
        self.sampler.rep_window = window;
    }

    /// Set the frequency penalty
    pub fn set_freq_penalty(&mut self, penalty: f32) {
        self.sampler.freq_penalty = penalty;
    }

    /// Current sampler tuning
    #[must_use]
    pub fn sampler(&self) -> &SamplerOptions {
        &self.sampler
    }

    /// Run one blocking generation
    ///
    /// # Errors
    ///
    /// Propagates forward-pass errors; unreachable for a loaded engine.
    pub fn generate(&mut self, prompt: &str, config: &GenerationConfig) -> Result<Generation> {
        generate(
            &mut self.model,
            &self.tokenizer,
            &self.sampler,
            &mut self.buffers,
            &mut self.rng,
            prompt,
            config,
        )
    }

    /// Encode text to token ids
    #[must_use]
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        self.tokenizer.encode(text, add_bos)
    }

    /// Decode a token sequence to text
    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        self.tokenizer.decode(ids)
    }

    /// Raw bytes for one token id (may be a partial UTF-8 sequence)
    #[must_use]
    pub fn decode_token(&self, id: u32) -> Vec<u8> {
        self.tokenizer.decode_token(id)
    }

    /// Tokenizer built from the container metadata
    #[must_use]
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Vocabulary size V
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.model.config.vocab_size
    }

    /// Embedding dimension D
    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.model.config.hidden_dim
    }

    /// Maximum sequence length
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.model.config.seq_len
    }
}
