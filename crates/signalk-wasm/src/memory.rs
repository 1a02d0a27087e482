//! Bounds-checked access to a guest's linear memory.
//!
//! Every primitive takes the [`Memory`] handle rather than a cached slice and
//! re-reads the buffer length on each call, so growth triggered by the guest
//! between two calls is always observed. Out-of-range access fails before any
//! byte is touched.

use std::ops::Range;

use wasmtime::{AsContext, AsContextMut, Memory};

use crate::error::{PluginError, Result};

/// Validate `[ptr, ptr + len)` against the current memory size.
pub fn checked_range(ptr: u32, len: u32, size: usize) -> Result<Range<usize>> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize);
    match end {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(PluginError::MemoryAccess {
            ptr: u64::from(ptr),
            len: u64::from(len),
            size: size as u64,
        }),
    }
}

/// Convert a guest-supplied `(ptr, len)` pair of signed ABI values.
///
/// Negative lengths cannot describe a valid region.
pub fn guest_region(ptr: i32, len: i32) -> Result<(u32, u32)> {
    if len < 0 {
        return Err(PluginError::MemoryAccess {
            ptr: u64::from(ptr as u32),
            len: len as i64 as u64,
            size: 0,
        });
    }
    Ok((ptr as u32, len as u32))
}

pub fn read_binary(store: impl AsContext, memory: &Memory, ptr: u32, len: u32) -> Result<Vec<u8>> {
    let data = memory.data(&store);
    let range = checked_range(ptr, len, data.len())?;
    Ok(data[range].to_vec())
}

pub fn read_utf8(store: impl AsContext, memory: &Memory, ptr: u32, len: u32) -> Result<String> {
    let bytes = read_binary(store, memory, ptr, len)?;
    String::from_utf8(bytes)
        .map_err(|e| PluginError::Protocol(format!("guest string at {ptr} is not UTF-8: {e}")))
}

/// Copy `value` into guest memory at `dest`.
///
/// Returns the number of bytes written, or 0 when `value` does not fit in
/// `max_len`. Nothing is written in that case.
pub fn write_binary(
    mut store: impl AsContextMut,
    memory: &Memory,
    value: &[u8],
    dest: u32,
    max_len: u32,
) -> Result<u32> {
    let Ok(len) = u32::try_from(value.len()) else {
        return Ok(0);
    };
    if len > max_len {
        return Ok(0);
    }
    let data = memory.data_mut(&mut store);
    let range = checked_range(dest, len, data.len())?;
    data[range].copy_from_slice(value);
    Ok(len)
}

pub fn write_string(
    store: impl AsContextMut,
    memory: &Memory,
    value: &str,
    dest: u32,
    max_len: u32,
) -> Result<u32> {
    write_binary(store, memory, value.as_bytes(), dest, max_len)
}

pub fn read_u32(store: impl AsContext, memory: &Memory, ptr: u32) -> Result<u32> {
    let bytes = read_binary(store, memory, ptr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
