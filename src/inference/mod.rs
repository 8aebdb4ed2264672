//! Transformer forward path with KV cache
//!
//! - [`model`] - weight registry, activation buffers, model loading
//! - [`kv_cache`] - per-layer key/value history
//! - `forward` - the per-token decoder pass
//!
//! The forward state machine is Empty (cur_pos = 0) -> Filling ->
//! Full (cur_pos = seq_len); [`LlamaModel::reset`] returns to Empty from
//! any state without freeing buffers.

mod forward;
pub mod kv_cache;
pub mod model;

pub use kv_cache::KvCache;
pub use model::{LayerWeights, LlamaModel, QuantTensor};
