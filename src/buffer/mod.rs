// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked, atomically-accessible view over a raw byte region.
//!
//! `ByteRegion` is the seam every other module in this crate is built on: a broadcast
//! buffer, a ring buffer, an error log, and a counters store are all "a `ByteRegion` plus
//! a fixed layout of offsets into it". The region itself knows nothing about any of those
//! layouts — it only knows how to read and write primitives safely and atomically.
//!
//! # Plain access vs. atomic access
//!
//! `get_i32`/`put_i32` (and the `i64` equivalents) are *not* atomic: they are ordinary
//! memory accesses, useful for fields that are owned exclusively by whichever side last
//! published them (payload bytes, encoded strings, labels). `load_acquire_*` /
//! `store_release_*` / `store_seqcst_*` / `cas_*` / `fetch_add_*` map onto the hardware's
//! atomic instructions and are the only accessors safe to race with a concurrent writer —
//! every control counter in this crate (tail, head, latest, seq, state, ...) goes through
//! one of those.
//!
//! Byte order only applies to the plain accessors: there is no way to apply an explicit
//! byte swap to a hardware atomic read-modify-write without destroying its atomicity, so
//! every atomic accessor here operates in the machine's native order.

mod backing;
mod order;

pub use backing::{BufferBacking, HeapBuffer};
pub use order::ByteOrder;

use crate::error::{AgronaError, Result};
use std::ptr;
use std::sync::atomic::{fence, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

/// Bytes in a cache line on the architectures this crate targets.
///
/// Trailers and counter-store slots are padded to multiples of this so that
/// independently-written control fields never share a cache line (false sharing).
pub const CACHE_LINE_LENGTH: usize = 64;

/// Round `value` up to the next multiple of `alignment` (`alignment` must be a power of two).
#[inline]
#[must_use]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Validate that `capacity` is a legal buffer body size (a power of two).
pub fn check_capacity(capacity: usize) -> Result<()> {
    if capacity.is_power_of_two() {
        Ok(())
    } else {
        Err(AgronaError::InvalidArgument(format!(
            "capacity {capacity} is not a power of two"
        )))
    }
}

/// A mutable, bounds-checked, atomically-accessible view over a contiguous memory range.
///
/// Cheap to clone: clones share the same backing memory (and keep it alive via `Arc`),
/// which is how a writer and any number of readers each get their own handle onto one
/// underlying region.
pub struct ByteRegion {
    backing: Arc<dyn BufferBacking>,
    ptr: *mut u8,
    len: usize,
    order: ByteOrder,
}

// SAFETY: the region may be shared across threads (and, when backed by shared memory,
// across processes). All mutation goes through bounds-checked accessors; atomic fields
// use the atomic primitives below, and plain fields are the caller's responsibility to
// synchronize (exactly as documented on `get_i32`/`put_i32`).
unsafe impl Send for ByteRegion {}
unsafe impl Sync for ByteRegion {}

impl Clone for ByteRegion {
    fn clone(&self) -> Self {
        Self {
            backing: Arc::clone(&self.backing),
            ptr: self.ptr,
            len: self.len,
            order: self.order,
        }
    }
}

impl ByteRegion {
    /// Wrap a heap-allocated, zero-initialized region of `capacity` bytes.
    pub fn new_heap(capacity: usize, order: ByteOrder) -> Result<Self> {
        Self::from_backing(Arc::new(HeapBuffer::new(capacity)), order)
    }

    /// Wrap an arbitrary backing store, verifying its base address is 8-byte aligned.
    ///
    /// This is the pre-use alignment verification the spec requires: atomics placed at
    /// offsets that are themselves 8-byte aligned relative to the base need the base
    /// itself aligned too, or the CPU will fault (or silently tear) on some architectures.
    pub fn from_backing(backing: Arc<dyn BufferBacking>, order: ByteOrder) -> Result<Self> {
        let ptr = backing.as_mut_ptr();
        let len = backing.len();
        let address = ptr as usize;
        if address % 8 != 0 {
            return Err(AgronaError::UnalignedAccess { address });
        }
        Ok(Self {
            backing,
            ptr,
            len,
            order,
        })
    }

    /// Total capacity of the region in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// The byte order plain (non-atomic) accessors use.
    #[inline]
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    fn bounds_check(&self, offset: usize, length: usize) -> Result<()> {
        let end = offset
            .checked_add(length)
            .ok_or(AgronaError::OutOfBounds {
                offset,
                length,
                capacity: self.len,
            })?;
        if end > self.len {
            return Err(AgronaError::OutOfBounds {
                offset,
                length,
                capacity: self.len,
            });
        }
        Ok(())
    }

    // ---- plain (non-atomic) primitive access -------------------------------------

    /// Read a 32-bit integer at `offset` using the region's configured byte order.
    pub fn get_i32(&self, offset: usize) -> Result<i32> {
        self.bounds_check(offset, 4)?;
        // SAFETY: bounds checked above; the region is valid for `len` bytes for its
        // lifetime, and reading 4 unaligned bytes never traps on the architectures this
        // crate targets.
        let bytes: [u8; 4] = unsafe { ptr::read_unaligned(self.ptr.add(offset).cast()) };
        Ok(self.order.decode_i32(bytes))
    }

    /// Write a 32-bit integer at `offset` using the region's configured byte order.
    pub fn put_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.bounds_check(offset, 4)?;
        let bytes = self.order.encode_i32(value);
        // SAFETY: bounds checked above.
        unsafe { ptr::write_unaligned(self.ptr.add(offset).cast(), bytes) };
        Ok(())
    }

    /// Read a 64-bit integer at `offset` using the region's configured byte order.
    pub fn get_i64(&self, offset: usize) -> Result<i64> {
        self.bounds_check(offset, 8)?;
        // SAFETY: bounds checked above.
        let bytes: [u8; 8] = unsafe { ptr::read_unaligned(self.ptr.add(offset).cast()) };
        Ok(self.order.decode_i64(bytes))
    }

    /// Write a 64-bit integer at `offset` using the region's configured byte order.
    pub fn put_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.bounds_check(offset, 8)?;
        let bytes = self.order.encode_i64(value);
        // SAFETY: bounds checked above.
        unsafe { ptr::write_unaligned(self.ptr.add(offset).cast(), bytes) };
        Ok(())
    }

    /// Unchecked fast path for [`Self::get_i32`]. Caller must guarantee `offset + 4 <=
    /// capacity()`.
    ///
    /// # Safety
    /// `offset + 4` must not exceed `capacity()`.
    #[inline]
    pub unsafe fn get_i32_unchecked(&self, offset: usize) -> i32 {
        let bytes: [u8; 4] = ptr::read_unaligned(self.ptr.add(offset).cast());
        self.order.decode_i32(bytes)
    }

    /// Unchecked fast path for [`Self::put_i32`].
    ///
    /// # Safety
    /// `offset + 4` must not exceed `capacity()`.
    #[inline]
    pub unsafe fn put_i32_unchecked(&self, offset: usize, value: i32) {
        ptr::write_unaligned(self.ptr.add(offset).cast(), self.order.encode_i32(value));
    }

    // ---- bulk byte access ----------------------------------------------------------

    /// Copy `src` into the region starting at `offset`.
    pub fn copy_from_slice(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.bounds_check(offset, src.len())?;
        // SAFETY: bounds checked; `src` and the destination region do not overlap
        // because `src` is a caller-owned slice, never a view into this region.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) };
        Ok(())
    }

    /// Copy `dst.len()` bytes from the region starting at `offset` into `dst`.
    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.bounds_check(offset, dst.len())?;
        // SAFETY: bounds checked; non-overlapping for the same reason as above.
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Fill `length` bytes starting at `offset` with `value`.
    pub fn set_memory(&self, offset: usize, length: usize, value: u8) -> Result<()> {
        self.bounds_check(offset, length)?;
        // SAFETY: bounds checked above.
        unsafe { ptr::write_bytes(self.ptr.add(offset), value, length) };
        Ok(())
    }

    // ---- length-prefixed string codecs ----------------------------------------------

    /// Write `s` at `offset` as a 4-byte length prefix followed by its ASCII bytes.
    /// Returns the total number of bytes written (`4 + s.len()`).
    pub fn put_string_ascii(&self, offset: usize, s: &str) -> Result<usize> {
        if !s.is_ascii() {
            return Err(AgronaError::InvalidArgument(
                "string is not pure ASCII".to_string(),
            ));
        }
        self.put_i32(offset, s.len() as i32)?;
        self.copy_from_slice(offset + 4, s.as_bytes())?;
        Ok(4 + s.len())
    }

    /// Read an ASCII string previously written with [`Self::put_string_ascii`].
    pub fn get_string_ascii(&self, offset: usize) -> Result<String> {
        let len = self.read_prefixed_len(offset)?;
        let mut buf = vec![0u8; len];
        self.copy_to_slice(offset + 4, &mut buf)?;
        if !buf.is_ascii() {
            return Err(AgronaError::InvalidArgument(
                "decoded bytes are not pure ASCII".to_string(),
            ));
        }
        // SAFETY: just verified the bytes are ASCII, which is always valid UTF-8.
        Ok(unsafe { String::from_utf8_unchecked(buf) })
    }

    /// Write `s` at `offset` as a 4-byte length prefix followed by its UTF-8 bytes.
    /// Returns the total number of bytes written (`4 + s.len()`).
    pub fn put_string_utf8(&self, offset: usize, s: &str) -> Result<usize> {
        self.put_i32(offset, s.len() as i32)?;
        self.copy_from_slice(offset + 4, s.as_bytes())?;
        Ok(4 + s.len())
    }

    /// Read a UTF-8 string previously written with [`Self::put_string_utf8`].
    pub fn get_string_utf8(&self, offset: usize) -> Result<String> {
        let len = self.read_prefixed_len(offset)?;
        let mut buf = vec![0u8; len];
        self.copy_to_slice(offset + 4, &mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| AgronaError::InvalidArgument(format!("invalid utf-8: {e}")))
    }

    fn read_prefixed_len(&self, offset: usize) -> Result<usize> {
        let len = self.get_i32(offset)?;
        if len < 0 {
            return Err(AgronaError::InvalidArgument(format!(
                "negative length prefix {len} at offset {offset}"
            )));
        }
        Ok(len as usize)
    }

    // ---- atomics ---------------------------------------------------------------------

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        // SAFETY: caller bounds-checked `offset` before reaching here; `AtomicI32`
        // requires 4-byte alignment, which every offset used by this crate's layouts
        // satisfies (headers/counters are always placed on 4- or 8-byte boundaries).
        unsafe { &*(self.ptr.add(offset).cast::<AtomicI32>()) }
    }

    #[inline]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        // SAFETY: see `atomic_i32`; 8-byte offsets are used for every `AtomicI64` field.
        unsafe { &*(self.ptr.add(offset).cast::<AtomicI64>()) }
    }

    /// Acquire-load a 32-bit word ("volatile get").
    pub fn load_acquire_i32(&self, offset: usize) -> Result<i32> {
        self.bounds_check(offset, 4)?;
        Ok(self.atomic_i32(offset).load(Ordering::Acquire))
    }

    /// Acquire-load a 64-bit word ("volatile get").
    pub fn load_acquire_i64(&self, offset: usize) -> Result<i64> {
        self.bounds_check(offset, 8)?;
        Ok(self.atomic_i64(offset).load(Ordering::Acquire))
    }

    /// Release-store a 32-bit word ("ordered put").
    pub fn store_release_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.bounds_check(offset, 4)?;
        self.atomic_i32(offset).store(value, Ordering::Release);
        Ok(())
    }

    /// Release-store a 64-bit word ("ordered put").
    pub fn store_release_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.bounds_check(offset, 8)?;
        self.atomic_i64(offset).store(value, Ordering::Release);
        Ok(())
    }

    /// Sequentially-consistent store ("volatile put") for the rare case where even
    /// release ordering is insufficient (e.g. a store that must not be reordered past a
    /// later unrelated load on the same thread).
    pub fn store_seqcst_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.bounds_check(offset, 8)?;
        self.atomic_i64(offset).store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Compare-and-set a 64-bit word. Returns `true` if `current == expected` and the
    /// word was updated to `new`.
    pub fn cas_i64(&self, offset: usize, expected: i64, new: i64) -> Result<bool> {
        self.bounds_check(offset, 8)?;
        Ok(self
            .atomic_i64(offset)
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok())
    }

    /// Add `delta` to the 64-bit word at `offset`, returning the prior value
    /// ("get-and-add").
    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> Result<i64> {
        self.bounds_check(offset, 8)?;
        Ok(self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel))
    }

    /// Add `delta` to the 32-bit word at `offset`, returning the prior value
    /// ("get-and-add").
    pub fn get_and_add_i32(&self, offset: usize, delta: i32) -> Result<i32> {
        self.bounds_check(offset, 4)?;
        Ok(self.atomic_i32(offset).fetch_add(delta, Ordering::AcqRel))
    }

    /// Swap in a new 64-bit value, returning the prior one ("get-and-set").
    pub fn get_and_set_i64(&self, offset: usize, value: i64) -> Result<i64> {
        self.bounds_check(offset, 8)?;
        Ok(self.atomic_i64(offset).swap(value, Ordering::AcqRel))
    }

    /// Release-store 8 raw bytes as one atomic 64-bit word.
    ///
    /// Used where two adjacent control sub-fields (e.g. a record's `length`/`typeId`
    /// pair) must become visible together — unlike [`Self::store_release_i32`] called
    /// twice, this can never let a reader observe one half updated and not the other.
    /// The bytes are an opaque bit pattern; callers are responsible for encoding and
    /// decoding them consistently (see [`Self::cas_bytes8`]).
    pub fn store_release_bytes8(&self, offset: usize, bytes: [u8; 8]) -> Result<()> {
        self.bounds_check(offset, 8)?;
        self.atomic_i64(offset)
            .store(i64::from_ne_bytes(bytes), Ordering::Release);
        Ok(())
    }

    /// Compare-and-set 8 raw bytes as one atomic 64-bit word.
    pub fn cas_bytes8(&self, offset: usize, expected: [u8; 8], new: [u8; 8]) -> Result<bool> {
        self.bounds_check(offset, 8)?;
        Ok(self
            .atomic_i64(offset)
            .compare_exchange(
                i64::from_ne_bytes(expected),
                i64::from_ne_bytes(new),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok())
    }

    /// Acquire fence.
    #[inline]
    pub fn fence_load(&self) {
        fence(Ordering::Acquire);
    }

    /// Release fence.
    #[inline]
    pub fn fence_store(&self) {
        fence(Ordering::Release);
    }

    /// Full (sequentially consistent) fence.
    #[inline]
    pub fn fence_full(&self) {
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_boundary() {
        assert_eq!(align(0, 8), 0);
        assert_eq!(align(1, 8), 8);
        assert_eq!(align(8, 8), 8);
        assert_eq!(align(9, 8), 16);
    }

    #[test]
    fn check_capacity_rejects_non_power_of_two() {
        assert!(check_capacity(1024).is_ok());
        assert!(check_capacity(777).is_err());
    }

    #[test]
    fn plain_primitive_roundtrip_native_order() {
        let region = ByteRegion::new_heap(64, ByteOrder::Native).unwrap();
        region.put_i32(0, -42).unwrap();
        assert_eq!(region.get_i32(0).unwrap(), -42);
        region.put_i64(8, i64::MIN + 7).unwrap();
        assert_eq!(region.get_i64(8).unwrap(), i64::MIN + 7);
    }

    #[test]
    fn plain_primitive_roundtrip_all_byte_orders() {
        for order in [ByteOrder::Native, ByteOrder::Big, ByteOrder::Little] {
            let region = ByteRegion::new_heap(64, order).unwrap();
            region.put_i32(0, 0x0102_0304).unwrap();
            assert_eq!(region.get_i32(0).unwrap(), 0x0102_0304);
            region.put_i64(16, -123_456_789_012i64).unwrap();
            assert_eq!(region.get_i64(16).unwrap(), -123_456_789_012i64);
        }
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let region = ByteRegion::new_heap(16, ByteOrder::Native).unwrap();
        assert!(matches!(
            region.get_i32(14),
            Err(AgronaError::OutOfBounds { .. })
        ));
        assert!(matches!(
            region.put_i64(9, 1),
            Err(AgronaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn atomic_acquire_release_roundtrip() {
        let region = ByteRegion::new_heap(64, ByteOrder::Native).unwrap();
        region.store_release_i64(0, 7).unwrap();
        assert_eq!(region.load_acquire_i64(0).unwrap(), 7);
        region.store_release_i32(8, -7).unwrap();
        assert_eq!(region.load_acquire_i32(8).unwrap(), -7);
    }

    #[test]
    fn cas_succeeds_only_on_match() {
        let region = ByteRegion::new_heap(64, ByteOrder::Native).unwrap();
        region.store_release_i64(0, 5).unwrap();
        assert!(!region.cas_i64(0, 4, 10).unwrap());
        assert_eq!(region.load_acquire_i64(0).unwrap(), 5);
        assert!(region.cas_i64(0, 5, 10).unwrap());
        assert_eq!(region.load_acquire_i64(0).unwrap(), 10);
    }

    #[test]
    fn get_and_add_returns_prior_value() {
        let region = ByteRegion::new_heap(64, ByteOrder::Native).unwrap();
        region.store_release_i64(0, 10).unwrap();
        assert_eq!(region.get_and_add_i64(0, 5).unwrap(), 10);
        assert_eq!(region.load_acquire_i64(0).unwrap(), 15);
    }

    #[test]
    fn string_ascii_roundtrip() {
        let region = ByteRegion::new_heap(128, ByteOrder::Native).unwrap();
        let n = region.put_string_ascii(0, "hello world").unwrap();
        assert_eq!(n, 4 + 11);
        assert_eq!(region.get_string_ascii(0).unwrap(), "hello world");
    }

    #[test]
    fn string_ascii_rejects_non_ascii() {
        let region = ByteRegion::new_heap(128, ByteOrder::Native).unwrap();
        assert!(region.put_string_ascii(0, "caf\u{e9}").is_err());
    }

    #[test]
    fn string_utf8_roundtrip() {
        let region = ByteRegion::new_heap(128, ByteOrder::Native).unwrap();
        let s = "caf\u{e9} \u{1f980}";
        region.put_string_utf8(0, s).unwrap();
        assert_eq!(region.get_string_utf8(0).unwrap(), s);
    }

    #[test]
    fn clone_shares_backing_memory() {
        let region = ByteRegion::new_heap(64, ByteOrder::Native).unwrap();
        let clone = region.clone();
        region.put_i64(0, 99).unwrap();
        assert_eq!(clone.load_acquire_i64(0).unwrap(), 99);
    }
}
