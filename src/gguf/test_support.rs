//! Synthetic GGUF fixture builder
//!
//! Builds byte-exact GGUF v3 containers in memory so the loader, model,
//! and engine test suites can exercise real parsing paths without
//! shipping model files. Not intended for production use.

use crate::gguf::types::{GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3};

const TYPE_U32: u32 = 4;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_I32: u32 = 5;

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Incremental GGUF container builder
#[derive(Default)]
pub struct GgufBuilder {
    metadata: Vec<u8>,
    metadata_count: u64,
    tensors: Vec<(String, Vec<u64>, u32, Vec<u8>)>,
}

impl GgufBuilder {
    /// Start an empty v3 container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn meta_entry(&mut self, key: &str, value_type: u32, payload: &[u8]) -> &mut Self {
        put_string(&mut self.metadata, key);
        self.metadata.extend_from_slice(&value_type.to_le_bytes());
        self.metadata.extend_from_slice(payload);
        self.metadata_count += 1;
        self
    }

    /// Add a string metadata entry
    pub fn string(&mut self, key: &str, value: &str) -> &mut Self {
        let mut payload = Vec::new();
        put_string(&mut payload, value);
        self.meta_entry(key, TYPE_STRING, &payload)
    }

    /// Add a u32 metadata entry
    pub fn u32(&mut self, key: &str, value: u32) -> &mut Self {
        self.meta_entry(key, TYPE_U32, &value.to_le_bytes())
    }

    /// Add an f32 metadata entry
    pub fn f32(&mut self, key: &str, value: f32) -> &mut Self {
        self.meta_entry(key, TYPE_F32, &value.to_le_bytes())
    }

    /// Add a bool metadata entry
    pub fn bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.meta_entry(key, TYPE_BOOL, &[u8::from(value)])
    }

    /// Add an array-of-strings metadata entry
    pub fn string_array(&mut self, key: &str, values: &[&str]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&TYPE_STRING.to_le_bytes());
        payload.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            put_string(&mut payload, v);
        }
        self.meta_entry(key, TYPE_ARRAY, &payload)
    }

    /// Add an array-of-f32 metadata entry
    pub fn f32_array(&mut self, key: &str, values: &[f32]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&TYPE_F32.to_le_bytes());
        payload.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.meta_entry(key, TYPE_ARRAY, &payload)
    }

    /// Add an array-of-i32 metadata entry
    pub fn i32_array(&mut self, key: &str, values: &[i32]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&TYPE_I32.to_le_bytes());
        payload.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.meta_entry(key, TYPE_ARRAY, &payload)
    }

    /// Add a raw metadata entry with an arbitrary type code (for
    /// malformed-container tests)
    pub fn raw_meta(&mut self, key: &str, value_type: u32, payload: &[u8]) -> &mut Self {
        self.meta_entry(key, value_type, payload)
    }

    /// Add a tensor. `dims` are in on-disk GGML order (innermost first);
    /// `data` is the raw tensor payload.
    pub fn tensor(&mut self, name: &str, dims: &[u64], dtype: u32, data: &[u8]) -> &mut Self {
        self.tensors.push((name.to_string(), dims.to_vec(), dtype, data.to_vec()));
        self
    }

    /// Serialize the container
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        out.extend_from_slice(&GGUF_VERSION_V3.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.metadata_count.to_le_bytes());
        out.extend_from_slice(&self.metadata);

        // Tensor directory with sequentially assigned, aligned offsets
        let mut offset = 0u64;
        for (name, dims, dtype, data) in &self.tensors {
            put_string(&mut out, name);
            out.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for d in dims {
                out.extend_from_slice(&d.to_le_bytes());
            }
            out.extend_from_slice(&dtype.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            offset += data.len() as u64;
            offset = offset.div_ceil(GGUF_DEFAULT_ALIGNMENT as u64) * GGUF_DEFAULT_ALIGNMENT as u64;
        }

        // Pad to the aligned tensor-data base
        while out.len() % GGUF_DEFAULT_ALIGNMENT != 0 {
            out.push(0);
        }

        for (_, _, _, data) in &self.tensors {
            out.extend_from_slice(data);
            while out.len() % GGUF_DEFAULT_ALIGNMENT != 0 {
                out.push(0);
            }
        }

        out
    }
}
