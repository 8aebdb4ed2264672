//! Process-wide engine singleton
//!
//! One [`Engine`] behind a process-wide mutex, exposing the operation
//! table a foreign-callable boundary consumes. Every function here is
//! non-throwing: operations on an uninitialized engine return zero
//! values, and a failed [`init`] leaves the slot empty. The mutex gives
//! a total order over all operations, so concurrent callers never race
//! the shared KV cache or sampling buffers.

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::engine::Engine;
use crate::generate::{Generation, GenerationConfig};

static ENGINE: Lazy<Mutex<Option<Engine>>> = Lazy::new(|| Mutex::new(None));

fn with_engine<T>(default: T, f: impl FnOnce(&mut Engine) -> T) -> T {
    let mut guard = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_mut() {
        Some(engine) => f(engine),
        None => default,
    }
}

/// Load the shared engine from a GGUF path. Returns `false` (and leaves
/// the engine uninitialized) on any load failure.
pub fn init(path: &str) -> bool {
    match Engine::load(path) {
        Ok(engine) => {
            let mut guard = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(engine);
            true
        },
        Err(err) => {
            warn!(%err, path, "engine init failed");
            false
        },
    }
}

/// Release the shared engine and all owned memory
pub fn free() {
    let mut guard = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    *guard = None;
}

/// True when [`init`] has succeeded and [`free`] has not run since
#[must_use]
pub fn is_initialized() -> bool {
    ENGINE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Clear the KV cache
pub fn reset() {
    with_engine((), Engine::reset);
}

/// Reseed the sampler RNG
pub fn set_seed(seed: u64) {
    with_engine((), |e| e.set_seed(seed));
}

/// Set the temperature floor
pub fn set_temp_floor(floor: f32) {
    with_engine((), |e| e.set_temp_floor(floor));
}

/// Set the repetition penalty and window
pub fn set_rep_penalty(penalty: f32, window: usize) {
    with_engine((), |e| e.set_rep_penalty(penalty, window));
}

/// Set the frequency penalty
pub fn set_freq_penalty(penalty: f32) {
    with_engine((), |e| e.set_freq_penalty(penalty));
}

/// Run one generation; an uninitialized engine (or an internal error)
/// yields an empty result rather than raising.
#[must_use]
pub fn generate(prompt: &str, config: &GenerationConfig) -> Generation {
    let empty = Generation {
        text: String::new(),
        token_count: 0,
    };
    with_engine(empty.clone(), |e| e.generate(prompt, config).unwrap_or(empty))
}

/// Encode text, truncated to `max_tokens` ids
#[must_use]
pub fn encode(text: &str, max_tokens: usize) -> Vec<u32> {
    with_engine(Vec::new(), |e| {
        let mut ids = e.encode(text, false);
        ids.truncate(max_tokens);
        ids
    })
}

/// Raw bytes for one token id; empty when uninitialized or out of range
#[must_use]
pub fn decode_token(id: u32) -> Vec<u8> {
    with_engine(Vec::new(), |e| e.decode_token(id))
}

/// Vocabulary size, 0 when uninitialized
#[must_use]
pub fn vocab_size() -> usize {
    with_engine(0, |e| e.vocab_size())
}

/// Embedding dimension, 0 when uninitialized
#[must_use]
pub fn embed_dim() -> usize {
    with_engine(0, |e| e.embed_dim())
}

/// Maximum sequence length, 0 when uninitialized
#[must_use]
pub fn seq_len() -> usize {
    with_engine(0, |e| e.seq_len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_uninitialized_operations_return_zero_values() {
        free();
        assert!(!is_initialized());
        assert_eq!(vocab_size(), 0);
        assert_eq!(embed_dim(), 0);
        assert_eq!(seq_len(), 0);
        assert!(encode("hello", 16).is_empty());
        assert!(decode_token(0).is_empty());

        let result = generate("hello", &GenerationConfig::default());
        assert!(result.text.is_empty());
        assert_eq!(result.token_count, 0);

        // Tuning and reset are silent no-ops
        reset();
        set_temp_floor(0.5);
        set_rep_penalty(1.2, 32);
        set_freq_penalty(0.1);
    }

    #[test]
    #[serial]
    fn test_init_failure_leaves_uninitialized() {
        free();
        assert!(!init("/nonexistent/model.gguf"));
        assert!(!is_initialized());
    }

    #[test]
    #[serial]
    fn test_init_generate_free_lifecycle() {
        let file = crate::engine::tests::tiny_gguf_file();
        assert!(init(file.path().to_str().expect("utf-8 path")));
        assert!(is_initialized());
        assert_eq!(vocab_size(), 8);
        assert_eq!(embed_dim(), 4);
        assert_eq!(seq_len(), 16);

        set_seed(99);
        let first = generate("a", &GenerationConfig::default().with_max_tokens(8));
        set_seed(99);
        let second = generate("a", &GenerationConfig::default().with_max_tokens(8));
        assert_eq!(first, second);

        let ids = encode("a b", 2);
        assert!(ids.len() <= 2);

        free();
        assert!(!is_initialized());
        assert_eq!(vocab_size(), 0);
    }
}
