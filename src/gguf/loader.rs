//! GGUF container parsing
//!
//! [`GgufFile`] holds the parsed header, metadata store, and tensor
//! directory; tensor bytes stay in the caller-provided file data (usually
//! a [`MappedGgufModel`]) and are sliced out on demand.
//!
//! Parsing is defensive: every count and length is bounds-checked against
//! the file before allocation, so a corrupted header cannot request
//! gigabytes.

use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use crate::error::{HablarError, Result};
use crate::gguf::io;
use crate::gguf::types::{
    GgufHeader, GgufValue, TensorInfo, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V2,
    GGUF_VERSION_V3,
};

/// Upper bound on the tensor directory; no supported model comes close
const MAX_TENSOR_COUNT: u64 = 100_000;
/// Upper bound on metadata entries
const MAX_METADATA_COUNT: u64 = 10_000;
/// Upper bound on metadata array length (vocabularies are ~150k entries)
const MAX_ARRAY_LEN: u64 = 10_000_000;
/// Tensors in this format have at most 4 dimensions
const MAX_DIMS: u32 = 4;

/// Parsed GGUF container
#[derive(Debug, Clone)]
pub struct GgufFile {
    /// File header
    pub header: GgufHeader,
    /// Metadata key-value store
    pub metadata: HashMap<String, GgufValue>,
    /// Tensor directory
    pub tensors: Vec<TensorInfo>,
    /// Byte offset of the aligned tensor-data base
    pub tensor_data_start: usize,
}

impl GgufFile {
    /// Parse a GGUF container from bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidContainer` on magic mismatch, unknown version, or
    /// malformed metadata.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = Self::parse_header(&mut cursor)?;
        let metadata = Self::parse_metadata(&mut cursor, header.metadata_count)?;
        let tensors = Self::parse_tensor_info(&mut cursor, header.tensor_count)?;

        // Tensor data begins at the next aligned position after the
        // directory; `general.alignment` defaults to 32.
        let alignment = metadata
            .get("general.alignment")
            .and_then(GgufValue::as_u64)
            .and_then(|a| usize::try_from(a).ok())
            .filter(|&a| a > 0)
            .unwrap_or(GGUF_DEFAULT_ALIGNMENT);
        #[allow(clippy::cast_possible_truncation)]
        let current_pos = cursor.position() as usize;
        let tensor_data_start = current_pos.div_ceil(alignment) * alignment;

        Ok(Self {
            header,
            metadata,
            tensors,
            tensor_data_start,
        })
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>) -> Result<GgufHeader> {
        let magic = io::read_u32(cursor)?;
        if magic != GGUF_MAGIC {
            return Err(HablarError::InvalidContainer {
                reason: format!("invalid magic 0x{magic:08X}, expected 0x{GGUF_MAGIC:08X}"),
            });
        }

        let version = io::read_u32(cursor)?;
        if version != GGUF_VERSION_V2 && version != GGUF_VERSION_V3 {
            return Err(HablarError::InvalidContainer {
                reason: format!("unsupported version {version}, expected 2 or 3"),
            });
        }

        let tensor_count = io::read_u64(cursor)?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(HablarError::InvalidContainer {
                reason: format!("tensor count {tensor_count} exceeds {MAX_TENSOR_COUNT}"),
            });
        }

        let metadata_count = io::read_u64(cursor)?;
        if metadata_count > MAX_METADATA_COUNT {
            return Err(HablarError::InvalidContainer {
                reason: format!("metadata count {metadata_count} exceeds {MAX_METADATA_COUNT}"),
            });
        }

        Ok(GgufHeader {
            magic,
            version,
            tensor_count,
            metadata_count,
        })
    }

    fn parse_metadata(
        cursor: &mut Cursor<&[u8]>,
        count: u64,
    ) -> Result<HashMap<String, GgufValue>> {
        let mut metadata = HashMap::new();

        for _ in 0..count {
            let key = io::read_string(cursor)?;
            let value_type = io::read_u32(cursor)?;
            let value = Self::read_value(cursor, value_type)?;
            metadata.insert(key, value);
        }

        Ok(metadata)
    }

    fn read_value(cursor: &mut Cursor<&[u8]>, value_type: u32) -> Result<GgufValue> {
        match value_type {
            0 => Ok(GgufValue::UInt8(io::read_u8(cursor)?)),
            1 => Ok(GgufValue::Int8(io::read_i8(cursor)?)),
            2 => Ok(GgufValue::UInt16(io::read_u16(cursor)?)),
            3 => Ok(GgufValue::Int16(io::read_i16(cursor)?)),
            4 => Ok(GgufValue::UInt32(io::read_u32(cursor)?)),
            5 => Ok(GgufValue::Int32(io::read_i32(cursor)?)),
            6 => Ok(GgufValue::Float32(io::read_f32(cursor)?)),
            7 => Ok(GgufValue::Bool(io::read_bool(cursor)?)),
            8 => Ok(GgufValue::String(io::read_string(cursor)?)),
            9 => {
                // Array: element type (u32) + length (u64) + elements
                let element_type = io::read_u32(cursor)?;
                let array_len = io::read_u64(cursor)?;
                if array_len > MAX_ARRAY_LEN {
                    return Err(HablarError::InvalidContainer {
                        reason: format!("array length {array_len} exceeds {MAX_ARRAY_LEN}"),
                    });
                }
                let len = usize::try_from(array_len).map_err(|_| HablarError::InvalidContainer {
                    reason: format!("array length {array_len} exceeds platform usize limit"),
                })?;

                let mut elements = Vec::with_capacity(len);
                for _ in 0..len {
                    elements.push(Self::read_value(cursor, element_type)?);
                }
                Ok(GgufValue::Array(elements))
            },
            10 => Ok(GgufValue::UInt64(io::read_u64(cursor)?)),
            11 => Ok(GgufValue::Int64(io::read_i64(cursor)?)),
            12 => Ok(GgufValue::Float64(io::read_f64(cursor)?)),
            other => Err(HablarError::InvalidContainer {
                reason: format!("unknown metadata value type {other}"),
            }),
        }
    }

    fn parse_tensor_info(cursor: &mut Cursor<&[u8]>, count: u64) -> Result<Vec<TensorInfo>> {
        let mut tensors = Vec::new();

        for _ in 0..count {
            let name = io::read_string(cursor)?;

            let n_dims = io::read_u32(cursor)?;
            if n_dims > MAX_DIMS {
                return Err(HablarError::InvalidContainer {
                    reason: format!("tensor '{name}' has {n_dims} dims, max is {MAX_DIMS}"),
                });
            }

            // GGUF stores dimensions innermost-first (GGML order); reverse
            // to row-major [out_dim, .., in_dim].
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(io::read_u64(cursor)?);
            }
            dims.reverse();

            let dtype = io::read_u32(cursor)?;
            let offset = io::read_u64(cursor)?;

            tensors.push(TensorInfo {
                name,
                n_dims,
                dims,
                dtype,
                offset,
            });
        }

        Ok(tensors)
    }

    /// Find a tensor directory entry by name
    #[must_use]
    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Slice a tensor's bytes out of the complete file data
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensor` if the dtype is unsupported or the byte
    /// range falls outside the file.
    pub fn tensor_bytes<'a>(&self, info: &TensorInfo, file_data: &'a [u8]) -> Result<&'a [u8]> {
        let dtype = crate::gguf::types::GgufDtype::from_code(info.dtype)?;
        let elements = info.element_count()?;
        let cols = info
            .dims
            .last()
            .and_then(|&d| usize::try_from(d).ok())
            .unwrap_or(elements);
        let rows = if cols == 0 { 0 } else { elements / cols };
        let byte_size = dtype.row_bytes(cols)? * rows;

        let offset = usize::try_from(info.offset).map_err(|_| HablarError::InvalidTensor {
            reason: format!("tensor '{}' offset exceeds platform usize limit", info.name),
        })?;
        let start = self.tensor_data_start + offset;
        let end = start
            .checked_add(byte_size)
            .ok_or_else(|| HablarError::InvalidTensor {
                reason: format!("tensor '{}' byte range overflows", info.name),
            })?;
        if end > file_data.len() {
            return Err(HablarError::InvalidTensor {
                reason: format!(
                    "tensor '{}' range [{start}, {end}) exceeds file size {}",
                    info.name,
                    file_data.len()
                ),
            });
        }

        Ok(&file_data[start..end])
    }

    // ------------------------------------------------------------------------
    // Metadata accessors
    // ------------------------------------------------------------------------

    /// Architecture string from `general.architecture`
    #[must_use]
    pub fn architecture(&self) -> Option<&str> {
        self.metadata.get("general.architecture").and_then(GgufValue::as_str)
    }

    fn arch_value(&self, suffix: &str) -> Option<&GgufValue> {
        let arch = self.architecture()?;
        self.metadata.get(&format!("{arch}.{suffix}"))
    }

    /// Architecture-scoped integer key (e.g. `llama.block_count`)
    #[must_use]
    pub fn arch_u64(&self, suffix: &str) -> Option<u64> {
        self.arch_value(suffix).and_then(GgufValue::as_u64)
    }

    /// Architecture-scoped float key (e.g. `llama.rope.freq_base`)
    #[must_use]
    pub fn arch_f32(&self, suffix: &str) -> Option<f32> {
        self.arch_value(suffix).and_then(GgufValue::as_f32)
    }

    /// Tokenizer model string (`llama` or `gpt2`)
    #[must_use]
    pub fn tokenizer_model(&self) -> Option<&str> {
        self.metadata.get("tokenizer.ggml.model").and_then(GgufValue::as_str)
    }

    /// Vocabulary token strings from `tokenizer.ggml.tokens`
    #[must_use]
    pub fn token_list(&self) -> Option<Vec<String>> {
        let items = self.metadata.get("tokenizer.ggml.tokens")?.as_array()?;
        let tokens: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(ToOwned::to_owned))
            .collect();
        if tokens.is_empty() {
            None
        } else {
            Some(tokens)
        }
    }

    /// SentencePiece merge scores from `tokenizer.ggml.scores`
    #[must_use]
    pub fn token_scores(&self) -> Option<Vec<f32>> {
        let items = self.metadata.get("tokenizer.ggml.scores")?.as_array()?;
        Some(items.iter().filter_map(GgufValue::as_f32).collect())
    }

    /// Token type tags from `tokenizer.ggml.token_type`
    #[must_use]
    pub fn token_types(&self) -> Option<Vec<i32>> {
        let items = self.metadata.get("tokenizer.ggml.token_type")?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(GgufValue::as_i64)
                .filter_map(|v| i32::try_from(v).ok())
                .collect(),
        )
    }

    /// GPT-2 merge rules from `tokenizer.ggml.merges`
    #[must_use]
    pub fn token_merges(&self) -> Option<Vec<String>> {
        let items = self.metadata.get("tokenizer.ggml.merges")?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToOwned::to_owned))
                .collect(),
        )
    }

    /// BOS token id; `None` when absent
    #[must_use]
    pub fn bos_token_id(&self) -> Option<i64> {
        self.metadata
            .get("tokenizer.ggml.bos_token_id")
            .and_then(GgufValue::as_i64)
    }

    /// EOS token id; `None` when absent
    #[must_use]
    pub fn eos_token_id(&self) -> Option<i64> {
        self.metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(GgufValue::as_i64)
    }

    /// Whether the tokenizer prepends BOS by default
    #[must_use]
    pub fn add_bos_token(&self) -> Option<bool> {
        self.metadata
            .get("tokenizer.ggml.add_bos_token")
            .and_then(GgufValue::as_bool)
    }

    /// Whether the tokenizer prepends a space before encoding
    #[must_use]
    pub fn add_space_prefix(&self) -> Option<bool> {
        self.metadata
            .get("tokenizer.ggml.add_space_prefix")
            .and_then(GgufValue::as_bool)
    }
}

/// Memory-mapped GGUF model for zero-copy tensor access
///
/// Uses `memmap2` so multi-hundred-megabyte weight files never pass
/// through a heap copy; the parsed directory indexes straight into the
/// mapping.
pub struct MappedGgufModel {
    /// Parsed container (header, metadata, tensor directory)
    pub file: GgufFile,
    mmap: Mmap,
}

impl MappedGgufModel {
    /// Load a GGUF model via memory mapping
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened or mapped, and container
    /// errors from [`GgufFile::from_bytes`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| HablarError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // SAFETY: the mapping is read-only and the file is not modified
        // while mapped.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| HablarError::Io {
                path: path.display().to_string(),
                reason: format!("mmap failed: {e}"),
            })?
        };

        let parsed = GgufFile::from_bytes(&mmap)?;
        info!(
            tensors = parsed.tensors.len(),
            metadata = parsed.metadata.len(),
            version = parsed.header.version,
            "parsed GGUF container"
        );

        let model = Self { file: parsed, mmap };
        model.advise_sequential();
        Ok(model)
    }

    /// Raw memory-mapped file contents
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Hint the kernel that the file will be read front to back during
    /// weight loading.
    #[cfg(unix)]
    fn advise_sequential(&self) {
        // SAFETY: the region is exactly the live mapping.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().cast_mut().cast::<libc::c_void>(),
                self.mmap.len(),
                libc::MADV_SEQUENTIAL,
            );
        }
    }

    #[cfg(not(unix))]
    fn advise_sequential(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::test_support::GgufBuilder;
    use crate::gguf::types::GGUF_TYPE_F32;

    #[test]
    fn test_parse_empty_container() {
        let data = GgufBuilder::new().build();
        let file = GgufFile::from_bytes(&data).expect("valid container");
        assert_eq!(file.header.tensor_count, 0);
        assert_eq!(file.header.metadata_count, 0);
        assert_eq!(file.tensor_data_start % 32, 0);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut data = GgufBuilder::new().build();
        data[0] = b'X';
        let err = GgufFile::from_bytes(&data).unwrap_err();
        assert!(matches!(err, HablarError::InvalidContainer { .. }));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let mut data = GgufBuilder::new().build();
        data[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            GgufFile::from_bytes(&data),
            Err(HablarError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn test_parse_accepts_v2() {
        let mut data = GgufBuilder::new().build();
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        let file = GgufFile::from_bytes(&data).expect("v2 accepted");
        assert_eq!(file.header.version, 2);
    }

    #[test]
    fn test_parse_rejects_absurd_counts() {
        let mut data = GgufBuilder::new().build();
        // tensor_count at offset 8
        data[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(GgufFile::from_bytes(&data).is_err());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let data = GgufBuilder::new()
            .string("general.architecture", "llama")
            .u32("llama.block_count", 2)
            .f32("llama.rope.freq_base", 10000.0)
            .bool("tokenizer.ggml.add_bos_token", true)
            .string_array("tokenizer.ggml.tokens", &["<unk>", "a", "b"])
            .build();

        let file = GgufFile::from_bytes(&data).expect("valid container");
        assert_eq!(file.architecture(), Some("llama"));
        assert_eq!(file.arch_u64("block_count"), Some(2));
        assert_eq!(file.arch_f32("rope.freq_base"), Some(10000.0));
        assert_eq!(file.add_bos_token(), Some(true));
        assert_eq!(
            file.token_list().unwrap(),
            vec!["<unk>".to_string(), "a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_tensor_directory_reverses_dims() {
        // Builder writes dims in GGML (innermost-first) order
        let data = GgufBuilder::new()
            .tensor("w", &[8, 4], GGUF_TYPE_F32, &vec![0u8; 8 * 4 * 4])
            .build();
        let file = GgufFile::from_bytes(&data).expect("valid container");
        let info = file.find_tensor("w").expect("tensor present");
        // Logical shape [rows=4, cols=8]
        assert_eq!(info.dims, vec![4, 8]);
    }

    #[test]
    fn test_tensor_bytes_bounds_check() {
        let data = GgufBuilder::new()
            .tensor("w", &[8], GGUF_TYPE_F32, &vec![0u8; 32])
            .build();
        let file = GgufFile::from_bytes(&data).expect("valid container");
        let info = file.find_tensor("w").unwrap().clone();
        assert_eq!(file.tensor_bytes(&info, &data).unwrap().len(), 32);

        // Truncate the file: the slice must fail, not panic
        let truncated = &data[..data.len() - 8];
        assert!(matches!(
            file.tensor_bytes(&info, truncated),
            Err(HablarError::InvalidTensor { .. })
        ));
    }

    #[test]
    fn test_unknown_value_type_rejected() {
        let data = GgufBuilder::new().raw_meta("bad", 99, &[]).build();
        assert!(matches!(
            GgufFile::from_bytes(&data),
            Err(HablarError::InvalidContainer { .. })
        ));
    }
}
