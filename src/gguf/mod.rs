//! GGUF (GPT-Generated Unified Format) parser
//!
//! Pure Rust implementation of the GGUF binary container format used by
//! llama.cpp, Ollama, and compatible tools.
//!
//! Format specification: <https://github.com/ggerganov/ggml/blob/master/docs/gguf.md>
//!
//! ## Module structure
//!
//! - [`types`] - constants, metadata values, header, tensor directory
//! - `io` - little-endian primitive readers
//! - [`loader`] - container parsing and the memory-mapped model
//! - [`config`] - model hyperparameter extraction
//! - [`test_support`] - synthetic container builder for the test suites

pub mod config;
pub(crate) mod io;
pub mod loader;
pub mod test_support;
pub mod types;

pub use config::ModelConfig;
pub use loader::{GgufFile, MappedGgufModel};
pub use types::{
    GgufDtype, GgufHeader, GgufValue, TensorInfo, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC,
    GGUF_TYPE_F16, GGUF_TYPE_F32, GGUF_TYPE_Q4_0, GGUF_VERSION_V2, GGUF_VERSION_V3,
};
