//! GGUF container types and constants
//!
//! Format specification: <https://github.com/ggerganov/ggml/blob/master/docs/gguf.md>
//!
//! ```text
//! GGUF := HEADER METADATA[] TENSOR_INFO[] padding TENSOR_DATA[]
//!
//! HEADER := {
//!   magic: u32 = 0x46554747 ("GGUF")
//!   version: u32
//!   tensor_count: u64
//!   metadata_count: u64
//! }
//! ```
//!
//! Everything is little-endian.

use crate::error::{HablarError, Result};

/// GGUF magic number: "GGUF" in little-endian
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Supported GGUF versions
pub const GGUF_VERSION_V2: u32 = 2;
/// Current GGUF version
pub const GGUF_VERSION_V3: u32 = 3;

/// Default tensor-data alignment when `general.alignment` is absent
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;

/// GGUF tensor dtype code: F32 (unquantized float32)
pub const GGUF_TYPE_F32: u32 = 0;
/// GGUF tensor dtype code: F16 (IEEE 754 binary16)
pub const GGUF_TYPE_F16: u32 = 1;
/// GGUF tensor dtype code: `Q4_0` (4-bit quantization, block size 32)
pub const GGUF_TYPE_Q4_0: u32 = 2;

/// Weight storage formats supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum GgufDtype {
    /// Unquantized float32
    F32,
    /// IEEE 754 binary16
    F16,
    /// 4-bit blocks of 32 with one f16 scale, zero point fixed at 8
    Q4_0,
}

impl GgufDtype {
    /// Decode a tensor-directory dtype code
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensor` for any code outside the supported set.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            GGUF_TYPE_F32 => Ok(Self::F32),
            GGUF_TYPE_F16 => Ok(Self::F16),
            GGUF_TYPE_Q4_0 => Ok(Self::Q4_0),
            other => Err(HablarError::InvalidTensor {
                reason: format!("unsupported tensor dtype code {other}"),
            }),
        }
    }

    /// Byte size of a row with `cols` elements
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensor` for a Q4_0 row whose length is not a
    /// multiple of the 32-value block size.
    pub fn row_bytes(self, cols: usize) -> Result<usize> {
        match self {
            Self::F32 => Ok(cols * 4),
            Self::F16 => Ok(cols * 2),
            Self::Q4_0 => {
                if cols % crate::quantize::BLOCK_SIZE != 0 {
                    return Err(HablarError::InvalidTensor {
                        reason: format!(
                            "Q4_0 row length {cols} is not a multiple of {}",
                            crate::quantize::BLOCK_SIZE
                        ),
                    });
                }
                Ok(cols / crate::quantize::BLOCK_SIZE * crate::quantize::Q4_0_BLOCK_BYTES)
            },
        }
    }
}

/// GGUF metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    /// Unsigned 8-bit integer
    UInt8(u8),
    /// Signed 8-bit integer
    Int8(i8),
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Signed 16-bit integer
    Int16(i16),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 32-bit integer
    Int32(i32),
    /// 32-bit floating point
    Float32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
    /// Array of values (homogeneous except for variable-length strings)
    Array(Vec<GgufValue>),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
}

impl GgufValue {
    /// Integer value at any width, widened to u64.
    ///
    /// Producers disagree on the width used for counts (u32 vs u64), so
    /// consumers coerce rather than match exact variants. Negative values
    /// and non-integer variants return `None`.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::UInt8(v) => Some(u64::from(v)),
            Self::UInt16(v) => Some(u64::from(v)),
            Self::UInt32(v) => Some(u64::from(v)),
            Self::UInt64(v) => Some(v),
            Self::Int8(v) => u64::try_from(v).ok(),
            Self::Int16(v) => u64::try_from(v).ok(),
            Self::Int32(v) => u64::try_from(v).ok(),
            Self::Int64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Signed integer value at any width
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::UInt8(v) => Some(i64::from(v)),
            Self::UInt16(v) => Some(i64::from(v)),
            Self::UInt32(v) => Some(i64::from(v)),
            Self::UInt64(v) => i64::try_from(v).ok(),
            Self::Int8(v) => Some(i64::from(v)),
            Self::Int16(v) => Some(i64::from(v)),
            Self::Int32(v) => Some(i64::from(v)),
            Self::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Float value (f32 or f64)
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float32(v) => Some(v),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float64(v) => Some(v as f32),
            _ => None,
        }
    }

    /// Boolean value
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// String value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Array elements
    #[must_use]
    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            Self::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

/// GGUF file header
#[derive(Debug, Clone, PartialEq)]
pub struct GgufHeader {
    /// Magic number (must be `GGUF_MAGIC`)
    pub magic: u32,
    /// Format version (2 or 3)
    pub version: u32,
    /// Number of tensors in the file
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_count: u64,
}

/// Tensor directory entry
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Tensor name (e.g. `blk.0.attn_q.weight`)
    pub name: String,
    /// Number of dimensions (at most 4)
    pub n_dims: u32,
    /// Row-major shape [outermost, .., innermost]
    pub dims: Vec<u64>,
    /// Raw dtype code from the directory
    pub dtype: u32,
    /// Byte offset relative to the tensor-data base
    pub offset: u64,
}

impl TensorInfo {
    /// Total element count
    ///
    /// # Errors
    ///
    /// Returns `InvalidContainer` if the dimension product overflows.
    pub fn element_count(&self) -> Result<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| {
                usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
            })
            .ok_or_else(|| HablarError::InvalidContainer {
                reason: format!("tensor '{}' dimensions overflow: {:?}", self.name, self.dims),
            })
    }
}
