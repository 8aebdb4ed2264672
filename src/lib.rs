//! # Hablar
//!
//! Pure Rust CPU inference for small decoder-only LLaMA-family language
//! models in the GGUF container format.
//!
//! Hablar (Spanish: "to speak") loads quantized weights, tokenizes text
//! with the vocabulary shipped in the container, runs an autoregressive
//! forward pass with a persistent KV cache, and samples tokens with
//! repetition/frequency penalties plus anti-degeneration guards.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hablar::{Engine, GenerationConfig};
//!
//! let mut engine = Engine::load("smollm2-360m-q4_0.gguf")?;
//! engine.set_seed(42);
//! let result = engine.generate(
//!     "why do cats purr?",
//!     &GenerationConfig::default().with_max_tokens(64).with_top_p(0.9),
//! )?;
//! println!("{}", result.text);
//! ```
//!
//! ## Architecture
//!
//! - [`gguf`] - container parsing, metadata store, tensor directory
//! - [`quantize`] - Q4_0 blocks and fused matrix-vector kernels
//! - [`tokenizer`] - SentencePiece / GPT-2 BPE from container metadata
//! - [`inference`] - per-token forward pass and KV cache
//! - [`sampling`] / [`generate`] - penalties, top-k/top-p, decode loop
//! - [`engine`] - the owned facade; [`shared`] - a process-wide singleton
//!
//! ## Scope
//!
//! Single conversation, single token at a time, CPU only. Weights may be
//! Q4_0, F16, or F32; everything else in the GGUF zoo is out of scope.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod generate;
pub mod gguf;
pub mod inference;
pub mod quantize;
pub mod sampling;
pub mod shared;
pub mod tokenizer;

// Re-exports for convenience
pub use engine::Engine;
pub use error::{HablarError, Result};
pub use generate::{Generation, GenerationConfig, SamplerOptions};
pub use inference::LlamaModel;
pub use tokenizer::Tokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
