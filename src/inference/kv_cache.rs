//! Key-value cache for autoregressive generation
//!
//! Stores past key and value projections per layer so each decoding step
//! attends over history in O(1) recomputation. Layout is
//! `[num_layers][max_seq_len * kv_dim]`, position-major, where `kv_dim`
//! is the grouped-query key/value width (fewer heads than the query
//! side).
//!
//! Invariant: slot `[layer, p]` is written exactly once, before any
//! attention read at a position >= p in that layer. The single-threaded
//! forward pass upholds this by storing before scoring.

/// Per-layer key/value history with a single position scalar
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Key cache: [num_layers][max_seq_len * kv_dim]
    k_cache: Vec<Vec<f32>>,
    /// Value cache: [num_layers][max_seq_len * kv_dim]
    v_cache: Vec<Vec<f32>>,
    /// Current sequence length (next position to fill)
    cur_pos: usize,
    kv_dim: usize,
    max_seq_len: usize,
}

impl KvCache {
    /// Create a cache sized once at model load
    #[must_use]
    pub fn new(num_layers: usize, kv_dim: usize, max_seq_len: usize) -> Self {
        Self {
            k_cache: vec![vec![0.0; max_seq_len * kv_dim]; num_layers],
            v_cache: vec![vec![0.0; max_seq_len * kv_dim]; num_layers],
            cur_pos: 0,
            kv_dim,
            max_seq_len,
        }
    }

    /// Write the key/value vectors for `(layer, pos)`.
    ///
    /// Out-of-range positions are ignored; the caller bounds `pos` by the
    /// sequence cap before decoding.
    pub fn store(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        if pos >= self.max_seq_len {
            return;
        }
        let start = pos * self.kv_dim;
        let end = start + self.kv_dim;
        self.k_cache[layer][start..end].copy_from_slice(k);
        self.v_cache[layer][start..end].copy_from_slice(v);
    }

    /// Keys for positions `0..len` of a layer
    #[must_use]
    pub fn k_prefix(&self, layer: usize, len: usize) -> &[f32] {
        &self.k_cache[layer][..len.min(self.max_seq_len) * self.kv_dim]
    }

    /// Values for positions `0..len` of a layer
    #[must_use]
    pub fn v_prefix(&self, layer: usize, len: usize) -> &[f32] {
        &self.v_cache[layer][..len.min(self.max_seq_len) * self.kv_dim]
    }

    /// Record that position `pos` has been filled in every layer
    pub fn mark_filled(&mut self, pos: usize) {
        self.cur_pos = self.cur_pos.max((pos + 1).min(self.max_seq_len));
    }

    /// Current sequence length
    #[must_use]
    pub fn len(&self) -> usize {
        self.cur_pos
    }

    /// True when no position has been filled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cur_pos == 0
    }

    /// True when every slot is filled
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cur_pos >= self.max_seq_len
    }

    /// Maximum sequence length
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.max_seq_len
    }

    /// Return to the empty state without freeing storage
    pub fn reset(&mut self) {
        self.cur_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cache_is_empty() {
        let cache = KvCache::new(4, 16, 128);
        assert!(cache.is_empty());
        assert!(!cache.is_full());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.max_len(), 128);
    }

    #[test]
    fn test_store_and_read_back() {
        let mut cache = KvCache::new(2, 4, 8);
        cache.store(0, 0, &[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0]);
        cache.mark_filled(0);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.k_prefix(0, 1), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.v_prefix(0, 1), &[5.0, 6.0, 7.0, 8.0]);
        // Layer 1 untouched
        assert_eq!(cache.k_prefix(1, 1), &[0.0; 4]);
    }

    #[test]
    fn test_positions_are_contiguous() {
        let mut cache = KvCache::new(1, 2, 8);
        cache.store(0, 0, &[1.0, 2.0], &[0.0, 0.0]);
        cache.mark_filled(0);
        cache.store(0, 1, &[3.0, 4.0], &[0.0, 0.0]);
        cache.mark_filled(1);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.k_prefix(0, 2), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_store_past_capacity_is_ignored() {
        let mut cache = KvCache::new(1, 2, 2);
        cache.store(0, 0, &[1.0, 1.0], &[1.0, 1.0]);
        cache.mark_filled(0);
        cache.store(0, 1, &[2.0, 2.0], &[2.0, 2.0]);
        cache.mark_filled(1);
        assert!(cache.is_full());

        cache.store(0, 2, &[9.0, 9.0], &[9.0, 9.0]);
        cache.mark_filled(2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.k_prefix(0, 2), &[1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut cache = KvCache::new(1, 4, 8);
        cache.store(0, 0, &[1.0; 4], &[2.0; 4]);
        cache.mark_filled(0);
        cache.reset();

        assert!(cache.is_empty());
        assert_eq!(cache.max_len(), 8);
        // Slots can be refilled after reset
        cache.store(0, 0, &[3.0; 4], &[4.0; 4]);
        cache.mark_filled(0);
        assert_eq!(cache.k_prefix(0, 1), &[3.0; 4]);
    }
}
