//! Bounds-checked access to a module's linear memory.
//!
//! [`Memory`] is the only way host code touches guest memory. Every access
//! is validated against the memory's current size: reads return `None` and
//! writes return `false` when `[offset, offset + width)` falls outside it.
//! Multi-byte values are little-endian.

#![allow(clippy::cast_possible_truncation)]

use std::ops::Range;

use wasmtime::StoreContextMut;

use crate::HostState;

/// Typed view over one linear memory.
pub struct Memory<'a> {
    inner: wasmtime::Memory,
    store: StoreContextMut<'a, HostState>,
}

impl<'a> Memory<'a> {
    /// Wrap an engine memory with the store that owns it.
    pub fn new(inner: wasmtime::Memory, store: StoreContextMut<'a, HostState>) -> Self {
        Self { inner, store }
    }

    /// Current size in 64 KiB pages.
    pub fn size(&self) -> u32 {
        self.inner.size(&self.store) as u32
    }

    /// Current size in bytes.
    pub fn data_size(&self) -> usize {
        self.inner.data_size(&self.store)
    }

    /// Grow by `delta` pages, returning the previous size in pages.
    ///
    /// Returns `None` if the memory would exceed its maximum or the
    /// configured limit. A failed grow leaves the size unchanged.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        self.inner
            .grow(&mut self.store, u64::from(delta))
            .ok()
            .map(|previous| previous as u32)
    }

    fn range(&self, offset: u32, len: u32) -> Option<Range<usize>> {
        let end = u64::from(offset) + u64::from(len);
        if end > self.data_size() as u64 {
            return None;
        }
        Some(offset as usize..end as usize)
    }

    fn read_array<const N: usize>(&self, offset: u32) -> Option<[u8; N]> {
        let range = self.range(offset, N as u32)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.inner.data(&self.store)[range]);
        Some(out)
    }

    fn write_array<const N: usize>(&mut self, offset: u32, bytes: [u8; N]) -> bool {
        self.write(offset, &bytes)
    }

    pub fn read_byte(&self, offset: u32) -> Option<u8> {
        self.read_array::<1>(offset).map(|b| b[0])
    }

    pub fn read_u16_le(&self, offset: u32) -> Option<u16> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    pub fn read_u32_le(&self, offset: u32) -> Option<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&self, offset: u32) -> Option<u64> {
        self.read_array(offset).map(u64::from_le_bytes)
    }

    pub fn read_f32_le(&self, offset: u32) -> Option<f32> {
        self.read_array(offset).map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&self, offset: u32) -> Option<f64> {
        self.read_array(offset).map(f64::from_le_bytes)
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let range = self.range(offset, len)?;
        Some(&self.inner.data(&self.store)[range])
    }

    /// Read `len` bytes as UTF-8. `None` when out of range or not valid UTF-8.
    pub fn read_string(&self, offset: u32, len: u32) -> Option<String> {
        let bytes = self.read(offset, len)?;
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    }

    pub fn write_byte(&mut self, offset: u32, value: u8) -> bool {
        self.write_array(offset, [value])
    }

    pub fn write_u16_le(&mut self, offset: u32, value: u16) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_u32_le(&mut self, offset: u32, value: u32) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_u64_le(&mut self, offset: u32, value: u64) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_f32_le(&mut self, offset: u32, value: f32) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_f64_le(&mut self, offset: u32, value: f64) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    /// Copy `bytes` into memory at `offset`. Nothing is written on failure.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> bool {
        let Ok(len) = u32::try_from(bytes.len()) else {
            return false;
        };
        let Some(range) = self.range(offset, len) else {
            return false;
        };
        self.inner.data_mut(&mut self.store)[range].copy_from_slice(bytes);
        true
    }
}

impl std::fmt::Debug for Memory<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use wasmtime::{AsContextMut, MemoryType, Store};

    use super::*;
    use crate::store::create_store;
    use crate::{ExecutionContext, WasmEngine};
    use edgevm_common::{EngineConfig, ExecutionConfig};

    fn store(limit_pages: u32) -> Store<HostState> {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let config = ExecutionConfig {
            memory_limit_pages: limit_pages,
            ..Default::default()
        };
        let state = HostState::new(ExecutionContext::builder().build(), &config);
        create_store(&engine, state, &config).unwrap()
    }

    fn one_page(store: &mut Store<HostState>) -> wasmtime::Memory {
        wasmtime::Memory::new(&mut *store, MemoryType::new(1, Some(2))).unwrap()
    }

    #[test]
    fn test_one_page_boundary() {
        let mut store = store(16);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());

        assert_eq!(memory.size(), 1);
        assert!(!memory.write_u32_le(65533, 7));
        assert!(memory.write_u32_le(65532, 7));
        assert_eq!(memory.read_u32_le(65532), Some(7));
        assert_eq!(memory.read_u32_le(65533), None);
    }

    #[test]
    fn test_every_width_at_the_edge() {
        let mut store = store(16);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());
        let end = 65_536u32;

        assert!(memory.write_byte(end - 1, 0xab));
        assert_eq!(memory.read_byte(end - 1), Some(0xab));
        assert_eq!(memory.read_byte(end), None);

        assert!(memory.write_u16_le(end - 2, 0xbeef));
        assert_eq!(memory.read_u16_le(end - 2), Some(0xbeef));
        assert_eq!(memory.read_u16_le(end - 1), None);

        assert!(memory.write_u64_le(end - 8, u64::MAX - 1));
        assert_eq!(memory.read_u64_le(end - 8), Some(u64::MAX - 1));
        assert!(!memory.write_u64_le(end - 7, 1));

        assert!(memory.write_f32_le(0, 1.5));
        assert_eq!(memory.read_f32_le(0), Some(1.5));
        assert!(memory.write_f64_le(8, -2.25));
        assert_eq!(memory.read_f64_le(8), Some(-2.25));
        assert_eq!(memory.read_f64_le(end - 4), None);

        // Offsets near u32::MAX must not wrap
        assert_eq!(memory.read_u32_le(u32::MAX - 1), None);
        assert!(!memory.write(u32::MAX, &[1, 2]));
    }

    #[test]
    fn test_little_endian_layout() {
        let mut store = store(16);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());

        assert!(memory.write_u32_le(16, 0x0102_0304));
        assert_eq!(memory.read(16, 4), Some(&[4u8, 3, 2, 1][..]));
    }

    #[test]
    fn test_read_string() {
        let mut store = store(16);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());

        assert!(memory.write(100, "héllo".as_bytes()));
        assert_eq!(memory.read_string(100, 6).as_deref(), Some("héllo"));
        // Cutting a multi-byte character is not valid UTF-8
        assert_eq!(memory.read_string(100, 2), None);
        assert_eq!(memory.read_string(65_530, 16), None);
    }

    #[test]
    fn test_grow_respects_maximum() {
        let mut store = store(16);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());

        assert_eq!(memory.grow(1), Some(1));
        assert_eq!(memory.size(), 2);
        // Type maximum is 2 pages
        assert_eq!(memory.grow(1), None);
        assert_eq!(memory.size(), 2);
        assert_eq!(memory.grow(0), Some(2));
        assert!(memory.write_u32_le(65_536 * 2 - 4, 1));
    }

    #[test]
    fn test_grow_respects_configured_limit() {
        let mut store = store(1);
        let raw = one_page(&mut store);
        let mut memory = Memory::new(raw, store.as_context_mut());

        assert_eq!(memory.grow(1), None);
        assert_eq!(memory.size(), 1);
    }
}
