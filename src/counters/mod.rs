// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counters store: allocation, free-list reuse, and iteration of named counters backed
//! by a pair of parallel byte regions.
//!
//! The values region holds one cache-line-padded slot per counter id; the metadata
//! region holds state, a caller-defined `typeId`, a fixed-size key area, and a label.
//! Counter id `i` addresses values slot `i` and metadata slot `i` in both regions.

use crate::buffer::{ByteRegion, CACHE_LINE_LENGTH};
use crate::error::{AgronaError, Result};
use parking_lot::Mutex;

/// Slot layout for both regions.
pub mod layout {
    use super::CACHE_LINE_LENGTH;

    pub const VALUES_SLOT_SIZE: usize = 2 * CACHE_LINE_LENGTH;
    pub const METADATA_SLOT_SIZE: usize = 4 * CACHE_LINE_LENGTH;

    pub const STATE_OFFSET: usize = 0;
    pub const TYPE_ID_OFFSET: usize = 4;
    pub const KEY_OFFSET: usize = 8;
    pub const KEY_LENGTH: usize = 2 * CACHE_LINE_LENGTH;
    pub const LABEL_LENGTH_OFFSET: usize = KEY_OFFSET + KEY_LENGTH;
    pub const LABEL_OFFSET: usize = LABEL_LENGTH_OFFSET + 4;
    pub const MAX_LABEL_LENGTH: usize = METADATA_SLOT_SIZE - LABEL_OFFSET;

    #[must_use]
    pub const fn values_offset(id: i32) -> usize {
        id as usize * VALUES_SLOT_SIZE
    }

    #[must_use]
    pub const fn metadata_offset(id: i32) -> usize {
        id as usize * METADATA_SLOT_SIZE
    }
}

use layout::*;

/// A counter slot's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Unused,
    Allocated,
    Reclaimed,
}

impl CounterState {
    fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Unused),
            1 => Ok(Self::Allocated),
            -1 => Ok(Self::Reclaimed),
            other => Err(AgronaError::InvalidArgument(format!(
                "unrecognized counter state word {other}"
            ))),
        }
    }

    const fn raw(self) -> i32 {
        match self {
            Self::Unused => 0,
            Self::Allocated => 1,
            Self::Reclaimed => -1,
        }
    }
}

/// Read-only view over a counters store: iteration and value reads.
///
/// Any number of readers may exist alongside a single [`CountersManager`] for the same
/// pair of regions.
pub struct CountersReader {
    values: ByteRegion,
    metadata: ByteRegion,
    max_counters: i32,
}

impl CountersReader {
    /// Wrap `values`/`metadata` regions for reading. The usable id range is bounded by
    /// whichever region has fewer slots.
    pub fn new(values: ByteRegion, metadata: ByteRegion) -> Self {
        let by_values = values.capacity() / VALUES_SLOT_SIZE;
        let by_metadata = metadata.capacity() / METADATA_SLOT_SIZE;
        let max_counters = by_values.min(by_metadata) as i32;
        Self {
            values,
            metadata,
            max_counters,
        }
    }

    /// Upper bound on ids this pair of regions can hold.
    #[must_use]
    pub fn max_counters(&self) -> i32 {
        self.max_counters
    }

    fn check_id(&self, id: i32) -> Result<()> {
        if id < 0 || id >= self.max_counters {
            return Err(AgronaError::InvalidArgument(format!(
                "counter id {id} out of range [0, {})",
                self.max_counters
            )));
        }
        Ok(())
    }

    /// The slot's current lifecycle state.
    pub fn state(&self, id: i32) -> Result<CounterState> {
        self.check_id(id)?;
        let raw = self.metadata.load_acquire_i32(metadata_offset(id) + STATE_OFFSET)?;
        CounterState::from_raw(raw)
    }

    /// The caller-supplied `typeId` recorded at allocation.
    pub fn type_id(&self, id: i32) -> Result<i32> {
        self.check_id(id)?;
        self.metadata.get_i32(metadata_offset(id) + TYPE_ID_OFFSET)
    }

    /// The raw key-area bytes recorded at allocation.
    pub fn key(&self, id: i32) -> Result<[u8; KEY_LENGTH]> {
        self.check_id(id)?;
        let mut buf = [0u8; KEY_LENGTH];
        self.metadata
            .copy_to_slice(metadata_offset(id) + KEY_OFFSET, &mut buf)?;
        Ok(buf)
    }

    /// The label recorded at allocation.
    pub fn label(&self, id: i32) -> Result<String> {
        self.check_id(id)?;
        self.metadata.get_string_utf8(metadata_offset(id) + LABEL_LENGTH_OFFSET)
    }

    /// `get` ("volatile get" / acquire-load): the counter's current value.
    pub fn get(&self, id: i32) -> Result<i64> {
        self.check_id(id)?;
        self.values.load_acquire_i64(values_offset(id))
    }

    /// `getWeak` (plain load): the counter's current value with no ordering guarantee.
    pub fn get_weak(&self, id: i32) -> Result<i64> {
        self.check_id(id)?;
        self.values.get_i64(values_offset(id))
    }

    /// Walk every slot in id order, invoking `consumer(id, typeId, label)` for each
    /// `allocated` slot and skipping `reclaimed` ones. Stops at the first `unused` slot.
    pub fn for_each<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(i32, i32, &str) -> Result<()>,
    {
        for id in 0..self.max_counters {
            let raw = self.metadata.load_acquire_i32(metadata_offset(id) + STATE_OFFSET)?;
            let state = CounterState::from_raw(raw)?;
            match state {
                CounterState::Unused => break,
                CounterState::Reclaimed => continue,
                CounterState::Allocated => {
                    let type_id = self.type_id(id)?;
                    let label = self.label(id)?;
                    consumer(id, type_id, &label)?;
                }
            }
        }
        Ok(())
    }
}

struct AllocatorState {
    free_list: Vec<i32>,
    next_id: i32,
}

/// Owns allocation and value mutation for a counters store; wraps the same regions a
/// [`CountersReader`] can be built over.
pub struct CountersManager {
    reader: CountersReader,
    allocator: Mutex<AllocatorState>,
}

impl CountersManager {
    /// Take ownership of `values`/`metadata` regions as a fresh (or freshly zeroed)
    /// counters store.
    pub fn new(values: ByteRegion, metadata: ByteRegion) -> Self {
        let reader = CountersReader::new(values, metadata);
        Self {
            reader,
            allocator: Mutex::new(AllocatorState {
                free_list: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Borrow a read-only view sharing the same regions.
    #[must_use]
    pub fn reader(&self) -> &CountersReader {
        &self.reader
    }

    /// Allocate a counter, invoking `key_writer` with the key area to fill and
    /// publishing it with `type_id` and `label`. Allocation (and [`Self::free`]) is
    /// single-threaded by contract; this serializes concurrent callers rather than
    /// relying on that contract being honored.
    pub fn allocate<F>(&self, label: &str, type_id: i32, key_writer: F) -> Result<i32>
    where
        F: FnOnce(&mut [u8; KEY_LENGTH]),
    {
        if label.len() > MAX_LABEL_LENGTH {
            return Err(AgronaError::InvalidArgument(format!(
                "label length {} exceeds max {MAX_LABEL_LENGTH}",
                label.len()
            )));
        }

        let mut allocator = self.allocator.lock();
        let (id, reused) = match allocator.free_list.pop() {
            Some(id) => (id, true),
            None => {
                let id = allocator.next_id;
                allocator.next_id += 1;
                (id, false)
            }
        };

        let values_capacity = self.reader.values.capacity();
        let metadata_capacity = self.reader.metadata.capacity();
        if values_offset(id) + VALUES_SLOT_SIZE > values_capacity
            || metadata_offset(id) + METADATA_SLOT_SIZE > metadata_capacity
        {
            return Err(AgronaError::InvalidArgument(format!(
                "counters store exhausted at id {id}"
            )));
        }

        if reused {
            self.reader.values.store_release_i64(values_offset(id), 0)?;
        }

        let meta_base = metadata_offset(id);
        self.reader.metadata.put_i32(meta_base + TYPE_ID_OFFSET, type_id)?;

        let mut key = [0u8; KEY_LENGTH];
        key_writer(&mut key);
        self.reader.metadata.copy_from_slice(meta_base + KEY_OFFSET, &key)?;

        self.reader
            .metadata
            .put_string_utf8(meta_base + LABEL_LENGTH_OFFSET, label)?;

        self.reader
            .metadata
            .store_release_i32(meta_base + STATE_OFFSET, CounterState::Allocated.raw())?;

        Ok(id)
    }

    /// Mark `id` reclaimed and return it to the free list. The value slot remains
    /// readable (and reusable) until the id is allocated again.
    pub fn free(&self, id: i32) -> Result<()> {
        self.reader.check_id(id)?;
        self.reader
            .metadata
            .store_release_i32(metadata_offset(id) + STATE_OFFSET, CounterState::Reclaimed.raw())?;
        self.allocator.lock().free_list.push(id);
        Ok(())
    }

    /// `get` (acquire-load).
    pub fn get(&self, id: i32) -> Result<i64> {
        self.reader.get(id)
    }

    /// `getWeak` (plain load).
    pub fn get_weak(&self, id: i32) -> Result<i64> {
        self.reader.get_weak(id)
    }

    /// `set` ("volatile store" / SeqCst store).
    pub fn set(&self, id: i32, value: i64) -> Result<()> {
        self.reader.check_id(id)?;
        self.reader.values.store_seqcst_i64(values_offset(id), value)
    }

    /// `setOrdered` (release store).
    pub fn set_ordered(&self, id: i32, value: i64) -> Result<()> {
        self.reader.check_id(id)?;
        self.reader.values.store_release_i64(values_offset(id), value)
    }

    /// `setWeak` (plain store).
    pub fn set_weak(&self, id: i32, value: i64) -> Result<()> {
        self.reader.check_id(id)?;
        self.reader.values.put_i64(values_offset(id), value)
    }

    /// `increment` (fetch-add by 1). Returns the prior value.
    pub fn increment(&self, id: i32) -> Result<i64> {
        self.add(id, 1)
    }

    /// `orderedIncrement` (plain read, release store of `read + 1`). Returns the prior
    /// value.
    pub fn increment_ordered(&self, id: i32) -> Result<i64> {
        self.add_ordered(id, 1)
    }

    /// `add` (fetch-add). Returns the prior value.
    pub fn add(&self, id: i32, delta: i64) -> Result<i64> {
        self.reader.check_id(id)?;
        self.reader.values.get_and_add_i64(values_offset(id), delta)
    }

    /// `addOrdered` (plain read, release store of `read + delta`). Returns the prior
    /// value.
    pub fn add_ordered(&self, id: i32, delta: i64) -> Result<i64> {
        self.reader.check_id(id)?;
        let offset = values_offset(id);
        let current = self.reader.values.get_i64(offset)?;
        self.reader.values.store_release_i64(offset, current + delta)?;
        Ok(current)
    }

    /// `proposeMax` (conditional release store if `current < proposed`). Not atomic
    /// across observers: under concurrent callers only the writer(s) whose proposal
    /// exceeds every value concurrently observed by others are guaranteed to survive.
    /// Returns whether this call's store took effect.
    pub fn propose_max(&self, id: i32, proposed: i64) -> Result<bool> {
        self.reader.check_id(id)?;
        let offset = values_offset(id);
        let current = self.reader.values.load_acquire_i64(offset)?;
        if proposed > current {
            self.reader.values.store_release_i64(offset, proposed)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// `proposeMaxOrdered`: same race semantics as [`Self::propose_max`], reading with
    /// `getWeak` instead of `get`.
    pub fn propose_max_ordered(&self, id: i32, proposed: i64) -> Result<bool> {
        self.reader.check_id(id)?;
        let offset = values_offset(id);
        let current = self.reader.values.get_i64(offset)?;
        if proposed > current {
            self.reader.values.store_release_i64(offset, proposed)?;
            return Ok(true);
        }
        Ok(false)
    }
}
