//! Guest-memory codecs for capability SDKs.
//!
//! SDK methods take pointers and lengths into the caller's memory and
//! report failures as an [`Errno`] code instead of trapping. Every access
//! goes through [`Memory`], so an out-of-range pointer becomes
//! [`Errno::AddressOutOfMemory`].
//!
//! # Layout
//!
//! - Sizes: `u32` little-endian, written to a separate size pointer so the
//!   guest can allocate before fetching the content
//! - Lists: `u32` item count, then each item as `u32` length + bytes

use edgevm_core::{Memory, Value};
use thiserror::Error;

/// SDK error code returned to the guest. `0` means success.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Errno {
    #[error("address out of memory")]
    AddressOutOfMemory = 1,
    #[error("byte conversion failed")]
    ByteConversionFailed = 2,
    #[error("string is not valid UTF-8")]
    InvalidUtf8 = 3,
    #[error("handle not found")]
    HandleNotFound = 4,
    #[error("handle space exhausted")]
    HandlesExhausted = 5,
    #[error("capability call failed")]
    CallFailed = 6,
}

impl Errno {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Errno::AddressOutOfMemory),
            2 => Some(Errno::ByteConversionFailed),
            3 => Some(Errno::InvalidUtf8),
            4 => Some(Errno::HandleNotFound),
            5 => Some(Errno::HandlesExhausted),
            6 => Some(Errno::CallFailed),
            _ => None,
        }
    }
}

/// Guest-facing result of an SDK method: a single `i32` code.
pub fn errno_values(result: Result<(), Errno>) -> Vec<Value> {
    let code = result.err().map_or(0, Errno::code);
    vec![Value::from(code)]
}

pub fn read_bytes(memory: &Memory<'_>, ptr: u32, size: u32) -> Result<Vec<u8>, Errno> {
    memory
        .read(ptr, size)
        .map(<[u8]>::to_vec)
        .ok_or(Errno::AddressOutOfMemory)
}

pub fn write_bytes(memory: &mut Memory<'_>, ptr: u32, data: &[u8]) -> Result<(), Errno> {
    if memory.write(ptr, data) {
        Ok(())
    } else {
        Err(Errno::AddressOutOfMemory)
    }
}

/// Write `data.len()` to `ptr`.
pub fn write_bytes_size(memory: &mut Memory<'_>, ptr: u32, data: &[u8]) -> Result<(), Errno> {
    let size = u32::try_from(data.len()).map_err(|_| Errno::ByteConversionFailed)?;
    write_u32_le(memory, ptr, size)
}

pub fn read_string(memory: &Memory<'_>, ptr: u32, len: u32) -> Result<String, Errno> {
    let bytes = memory.read(ptr, len).ok_or(Errno::AddressOutOfMemory)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Errno::InvalidUtf8)
}

pub fn write_string(memory: &mut Memory<'_>, ptr: u32, value: &str) -> Result<(), Errno> {
    write_bytes(memory, ptr, value.as_bytes())
}

pub fn write_string_size(memory: &mut Memory<'_>, ptr: u32, value: &str) -> Result<(), Errno> {
    write_bytes_size(memory, ptr, value.as_bytes())
}

pub fn read_u32_le(memory: &Memory<'_>, ptr: u32) -> Result<u32, Errno> {
    memory.read_u32_le(ptr).ok_or(Errno::AddressOutOfMemory)
}

pub fn write_u32_le(memory: &mut Memory<'_>, ptr: u32, value: u32) -> Result<(), Errno> {
    if memory.write_u32_le(ptr, value) {
        Ok(())
    } else {
        Err(Errno::AddressOutOfMemory)
    }
}

pub fn write_u64_le(memory: &mut Memory<'_>, ptr: u32, value: u64) -> Result<(), Errno> {
    if memory.write_u64_le(ptr, value) {
        Ok(())
    } else {
        Err(Errno::AddressOutOfMemory)
    }
}

/// Encode a list of byte strings.
pub fn encode_list<T: AsRef<[u8]>>(items: &[T]) -> Result<Vec<u8>, Errno> {
    let count = u32::try_from(items.len()).map_err(|_| Errno::ByteConversionFailed)?;
    let total: usize = items.iter().map(|item| 4 + item.as_ref().len()).sum();

    let mut out = Vec::with_capacity(4 + total);
    out.extend_from_slice(&count.to_le_bytes());
    for item in items {
        let item = item.as_ref();
        let len = u32::try_from(item.len()).map_err(|_| Errno::ByteConversionFailed)?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(item);
    }
    Ok(out)
}

/// Decode a list produced by [`encode_list`]. Trailing bytes are rejected.
pub fn decode_list(mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, Errno> {
    fn take<'b>(bytes: &mut &'b [u8], n: usize) -> Result<&'b [u8], Errno> {
        if bytes.len() < n {
            return Err(Errno::ByteConversionFailed);
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    }
    fn take_u32(bytes: &mut &[u8]) -> Result<usize, Errno> {
        let raw = take(bytes, 4)?;
        let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        usize::try_from(value).map_err(|_| Errno::ByteConversionFailed)
    }

    let count = take_u32(&mut bytes)?;
    // Each item needs at least its length prefix
    if count > bytes.len() / 4 {
        return Err(Errno::ByteConversionFailed);
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u32(&mut bytes)?;
        items.push(take(&mut bytes, len)?.to_vec());
    }

    if !bytes.is_empty() {
        return Err(Errno::ByteConversionFailed);
    }
    Ok(items)
}

pub fn read_bytes_list(memory: &Memory<'_>, ptr: u32, size: u32) -> Result<Vec<Vec<u8>>, Errno> {
    let bytes = memory.read(ptr, size).ok_or(Errno::AddressOutOfMemory)?;
    decode_list(bytes)
}

pub fn write_bytes_list<T: AsRef<[u8]>>(
    memory: &mut Memory<'_>,
    ptr: u32,
    items: &[T],
) -> Result<(), Errno> {
    write_bytes(memory, ptr, &encode_list(items)?)
}

/// Write the encoded size of `items` to `ptr`.
pub fn write_bytes_list_size<T: AsRef<[u8]>>(
    memory: &mut Memory<'_>,
    ptr: u32,
    items: &[T],
) -> Result<(), Errno> {
    write_bytes_size(memory, ptr, &encode_list(items)?)
}

pub fn read_string_list(memory: &Memory<'_>, ptr: u32, size: u32) -> Result<Vec<String>, Errno> {
    read_bytes_list(memory, ptr, size)?
        .into_iter()
        .map(|item| String::from_utf8(item).map_err(|_| Errno::InvalidUtf8))
        .collect()
}

pub fn write_string_list<T: AsRef<str>>(
    memory: &mut Memory<'_>,
    ptr: u32,
    items: &[T],
) -> Result<(), Errno> {
    let items: Vec<&[u8]> = items.iter().map(|item| item.as_ref().as_bytes()).collect();
    write_bytes_list(memory, ptr, &items)
}

pub fn write_string_list_size<T: AsRef<str>>(
    memory: &mut Memory<'_>,
    ptr: u32,
    items: &[T],
) -> Result<(), Errno> {
    let items: Vec<&[u8]> = items.iter().map(|item| item.as_ref().as_bytes()).collect();
    write_bytes_list_size(memory, ptr, &items)
}
