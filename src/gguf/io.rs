//! GGUF primitive I/O readers
//!
//! Low-level little-endian reading functions for GGUF format parsing.
//! A short read anywhere means the container is truncated, so every
//! failure maps to `InvalidContainer`.

use crate::error::{HablarError, Result};
use std::io::{Cursor, Read};

fn truncated(what: &str, e: &std::io::Error) -> HablarError {
    HablarError::InvalidContainer {
        reason: format!("truncated while reading {what}: {e}"),
    }
}

/// Read a single u8 from the cursor.
pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|e| truncated("u8", &e))?;
    Ok(buf[0])
}

/// Read a single i8 from the cursor.
pub(crate) fn read_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|e| truncated("i8", &e))?;
    Ok(i8::from_le_bytes(buf))
}

/// Read a u16 (little-endian) from the cursor.
pub(crate) fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(|e| truncated("u16", &e))?;
    Ok(u16::from_le_bytes(buf))
}

/// Read an i16 (little-endian) from the cursor.
pub(crate) fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(|e| truncated("i16", &e))?;
    Ok(i16::from_le_bytes(buf))
}

/// Read a u32 (little-endian) from the cursor.
pub(crate) fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|e| truncated("u32", &e))?;
    Ok(u32::from_le_bytes(buf))
}

/// Read an i32 (little-endian) from the cursor.
pub(crate) fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|e| truncated("i32", &e))?;
    Ok(i32::from_le_bytes(buf))
}

/// Read an f32 (little-endian) from the cursor.
pub(crate) fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|e| truncated("f32", &e))?;
    Ok(f32::from_le_bytes(buf))
}

/// Read a bool from the cursor. Any non-zero byte is true.
pub(crate) fn read_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|e| truncated("bool", &e))?;
    Ok(buf[0] != 0)
}

/// Read a u64 (little-endian) from the cursor.
pub(crate) fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(|e| truncated("u64", &e))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read an i64 (little-endian) from the cursor.
pub(crate) fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(|e| truncated("i64", &e))?;
    Ok(i64::from_le_bytes(buf))
}

/// Read an f64 (little-endian) from the cursor.
pub(crate) fn read_f64(cursor: &mut Cursor<&[u8]>) -> Result<f64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(|e| truncated("f64", &e))?;
    Ok(f64::from_le_bytes(buf))
}

/// Read a string: u64 length prefix + UTF-8 bytes.
pub(crate) fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len_u64 = read_u64(cursor)?;
    let len = usize::try_from(len_u64).map_err(|_| HablarError::InvalidContainer {
        reason: format!("string length {len_u64} exceeds platform usize limit"),
    })?;

    // A length prefix larger than the remaining file is a corrupt header,
    // not a real allocation request.
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(HablarError::InvalidContainer {
            reason: format!("string length {len} exceeds remaining file size {remaining}"),
        });
    }

    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| truncated("string data", &e))?;

    String::from_utf8(bytes).map_err(|e| HablarError::InvalidContainer {
        reason: format!("string is not valid UTF-8: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_primitives() {
        let data: Vec<u8> = vec![
            0x2A, // u8 42
            0x01, 0x00, 0x00, 0x00, // u32 1
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // u64 max
        ];
        let mut cursor = Cursor::new(data.as_slice());
        assert_eq!(read_u8(&mut cursor).unwrap(), 42);
        assert_eq!(read_u32(&mut cursor).unwrap(), 1);
        assert_eq!(read_u64(&mut cursor).unwrap(), u64::MAX);
    }

    #[test]
    fn test_read_string() {
        let mut data = 5u64.to_le_bytes().to_vec();
        data.extend_from_slice(b"hello");
        let mut cursor = Cursor::new(data.as_slice());
        assert_eq!(read_string(&mut cursor).unwrap(), "hello");
    }

    #[test]
    fn test_read_string_length_past_eof() {
        let data = 1000u64.to_le_bytes().to_vec();
        let mut cursor = Cursor::new(data.as_slice());
        assert!(matches!(
            read_string(&mut cursor),
            Err(HablarError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn test_short_read_is_invalid_container() {
        let data = [0u8; 2];
        let mut cursor = Cursor::new(data.as_slice());
        assert!(matches!(
            read_u32(&mut cursor),
            Err(HablarError::InvalidContainer { .. })
        ));
    }
}
