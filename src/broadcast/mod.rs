// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-writer, many-reader broadcast buffer with overwrite semantics.
//!
//! A transmitter publishes records into a power-of-two body; any number of receivers on
//! the same region observe them in publication order. There is no delivery guarantee —
//! a slow reader can be lapped by the writer, and detects this through
//! [`BroadcastReceiver::lapped_count`] rather than blocking the writer.
//!
//! ```text
//!   body: [ record | record | padding | record | ... ]     trailer: tailIntent, tail, latest
//!          ^                                    ^
//!          record boundaries land on 8-byte alignment
//! ```

use crate::buffer::{align, check_capacity, ByteRegion, CACHE_LINE_LENGTH};
use crate::diagnostics::{trace_op, warn_event};
use crate::error::{AgronaError, Result};

/// Trailer and record layout offsets. Bit-exact; must match any other implementation
/// sharing this region.
pub mod layout {
    use super::CACHE_LINE_LENGTH;

    /// Trailer offset of the soft upper bound on the writer's claimed range.
    pub const TAIL_INTENT_OFFSET: usize = 0;
    /// Trailer offset of the committed tail position.
    pub const TAIL_OFFSET: usize = 8;
    /// Trailer offset of the absolute stream position of the most recently published
    /// record.
    pub const LATEST_OFFSET: usize = 16;
    /// Total trailer length, cache-line padded.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

    /// Record header: `int32 length` then `int32 typeId`.
    pub const HEADER_LENGTH: usize = 8;
    /// `typeId` reserved for padding records.
    pub const PADDING_MSG_TYPE_ID: i32 = -1;
    /// Records are aligned to the header length.
    pub const RECORD_ALIGNMENT: usize = HEADER_LENGTH;
}

use layout::*;

fn max_msg_length(capacity: usize) -> usize {
    capacity / 8
}

/// The single writer side of a broadcast buffer. Not reentrant: exactly one thread may
/// call [`Self::transmit`] on a given transmitter.
pub struct BroadcastTransmitter {
    region: ByteRegion,
    capacity: usize,
}

impl BroadcastTransmitter {
    /// Wrap `region`, whose capacity must be `capacity + TRAILER_LENGTH` with `capacity`
    /// a power of two.
    pub fn new(region: ByteRegion, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        if region.capacity() < capacity + TRAILER_LENGTH {
            return Err(AgronaError::InvalidArgument(format!(
                "region capacity {} too small for body {capacity} + trailer {TRAILER_LENGTH}",
                region.capacity()
            )));
        }
        Ok(Self { region, capacity })
    }

    /// Maximum payload length this buffer can carry.
    #[must_use]
    pub fn max_msg_length(&self) -> usize {
        max_msg_length(self.capacity)
    }

    #[inline]
    fn trailer_offset(&self, field: usize) -> usize {
        self.capacity + field
    }

    fn write_header(&self, record_offset: usize, length: i32, type_id: i32) -> Result<()> {
        self.region.put_i32(record_offset, length)?;
        self.region.put_i32(record_offset + 4, type_id)?;
        Ok(())
    }

    /// Publish `payload` tagged with `type_id` (must be `>= 1`).
    pub fn transmit(&self, type_id: i32, payload: &[u8]) -> Result<()> {
        if type_id < 1 {
            return Err(AgronaError::InvalidArgument(format!(
                "typeId must be >= 1, got {type_id}"
            )));
        }
        if payload.len() > self.max_msg_length() {
            return Err(AgronaError::InvalidArgument(format!(
                "payload length {} exceeds max {}",
                payload.len(),
                self.max_msg_length()
            )));
        }

        let record_length = HEADER_LENGTH + payload.len();
        let aligned_len = align(record_length, RECORD_ALIGNMENT);

        // Step 2: read tail (owned exclusively by this writer).
        let mut tail = self.region.get_i64(self.trailer_offset(TAIL_OFFSET))?;
        let mut record_offset = (tail as usize) % self.capacity;

        // Step 3: wrap handling — reserve a padding record if the remainder of the body
        // cannot hold the aligned record.
        if self.capacity - record_offset < aligned_len {
            let remainder = self.capacity - record_offset;
            let new_tail_after_record = tail + aligned_len as i64;
            let tail_intent = new_tail_after_record + remainder as i64;
            self.region
                .put_i64(self.trailer_offset(TAIL_INTENT_OFFSET), tail_intent)?;
            self.region.fence_store();

            self.write_header(record_offset, remainder as i32, PADDING_MSG_TYPE_ID)?;

            tail += remainder as i64;
            record_offset = 0;
        }

        let new_tail = tail + aligned_len as i64;

        // Step 4: publish tail-intent for the record itself.
        self.region
            .put_i64(self.trailer_offset(TAIL_INTENT_OFFSET), new_tail)?;
        self.region.fence_store();

        // Step 5: write header and payload.
        self.write_header(record_offset, record_length as i32, type_id)?;
        self.region
            .copy_from_slice(record_offset + HEADER_LENGTH, payload)?;

        // Step 6: record latest as the absolute stream position of this record.
        self.region
            .put_i64(self.trailer_offset(LATEST_OFFSET), tail)?;

        // Step 7: ordered-store the new tail, publishing the record to readers.
        self.region
            .store_release_i64(self.trailer_offset(TAIL_OFFSET), new_tail)?;

        trace_op!("broadcast transmit typeId={type_id} at tail={tail} length={record_length}");
        Ok(())
    }
}

/// A reader over a broadcast buffer. Holds its own cursor; never blocks, never
/// allocates, and may fall arbitrarily far behind the writer (at the cost of lost
/// messages, reported via [`Self::lapped_count`]).
pub struct BroadcastReceiver {
    region: ByteRegion,
    capacity: usize,
    cursor: i64,
    next_record: i64,
    lapped_count: i64,
    record_offset: usize,
}

impl BroadcastReceiver {
    /// Wrap `region`, whose capacity must be `capacity + TRAILER_LENGTH`.
    pub fn new(region: ByteRegion, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        if region.capacity() < capacity + TRAILER_LENGTH {
            return Err(AgronaError::InvalidArgument(format!(
                "region capacity {} too small for body {capacity} + trailer {TRAILER_LENGTH}",
                region.capacity()
            )));
        }
        let latest = region.get_i64(capacity + LATEST_OFFSET)?;
        Ok(Self {
            region,
            capacity,
            cursor: latest,
            next_record: latest,
            lapped_count: 0,
            record_offset: (latest as usize) % capacity.max(1),
        })
    }

    #[inline]
    fn trailer_offset(&self, field: usize) -> usize {
        self.capacity + field
    }

    fn is_within_window(&self, position: i64) -> Result<bool> {
        let tail_intent = self
            .region
            .load_acquire_i64(self.trailer_offset(TAIL_INTENT_OFFSET))?;
        Ok(position + self.capacity as i64 > tail_intent)
    }

    /// Advance to the next record, if any is available. Returns `false` if the writer
    /// has published nothing new since the last call.
    pub fn receive_next(&mut self) -> Result<bool> {
        let tail = self
            .region
            .load_acquire_i64(self.trailer_offset(TAIL_OFFSET))?;
        if tail <= self.next_record {
            return Ok(false);
        }

        let mut cursor = self.next_record;
        if !self.is_within_window(cursor)? {
            self.lapped_count += 1;
            cursor = self.region.get_i64(self.trailer_offset(LATEST_OFFSET))?;
            warn_event!(
                "broadcast receiver lapped (lappedCount={}), resynced to latest={cursor}",
                self.lapped_count
            );
        }
        let mut record_offset = (cursor as usize) % self.capacity;

        self.cursor = cursor;
        let length = self.region.get_i32(record_offset)?;
        self.next_record = cursor + align(length as usize, RECORD_ALIGNMENT) as i64;

        let type_id = self.region.get_i32(record_offset + 4)?;
        if type_id == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            let length0 = self.region.get_i32(0)?;
            self.next_record += align(length0 as usize, RECORD_ALIGNMENT) as i64;
        }

        self.record_offset = record_offset;
        Ok(true)
    }

    /// The `typeId` of the current record.
    pub fn type_id(&self) -> Result<i32> {
        self.region.get_i32(self.record_offset + 4)
    }

    /// Payload length of the current record (header excluded).
    pub fn length(&self) -> Result<usize> {
        let record_length = self.region.get_i32(self.record_offset)?;
        Ok(record_length as usize - HEADER_LENGTH)
    }

    /// Byte offset of the current record's payload, within the region's body.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.record_offset + HEADER_LENGTH
    }

    /// Re-validate that the current record has not been overwritten since it was
    /// selected by [`Self::receive_next`]. Call after consuming the payload.
    pub fn validate(&self) -> Result<bool> {
        self.region.fence_load();
        self.is_within_window(self.cursor)
    }

    /// Number of times the writer has lapped this receiver.
    #[must_use]
    pub fn lapped_count(&self) -> i64 {
        self.lapped_count
    }

    /// Direct access to the backing region, used by [`CopyBroadcastReceiver`].
    #[must_use]
    pub fn region(&self) -> &ByteRegion {
        &self.region
    }
}

/// A [`BroadcastReceiver`] that copies each message into an owned scratch buffer before
/// handing it to the caller, so the caller's view stays internally consistent even if a
/// lap occurs mid-handler.
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    /// Wrap `receiver`.
    #[must_use]
    pub fn new(receiver: BroadcastReceiver) -> Self {
        Self {
            receiver,
            scratch: Vec::with_capacity(4096),
        }
    }

    /// Attempt to receive one message, invoking `handler(typeId, payload)` if one was
    /// available. Returns `1` if a message was delivered, `0` otherwise.
    ///
    /// Returns an error (rather than silently delivering a torn message) if the
    /// receiver was lapped while this call was reading the record.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<u32>
    where
        F: FnMut(i32, &[u8]),
    {
        let lapped_before = self.receiver.lapped_count();
        if !self.receiver.receive_next()? {
            return Ok(0);
        }
        if lapped_before != self.receiver.lapped_count() {
            return Err(AgronaError::InvalidArgument(
                "receiver lapped while selecting the next record".to_string(),
            ));
        }

        let length = self.receiver.length()?;
        let type_id = self.receiver.type_id()?;
        self.scratch.resize(length, 0);
        self.receiver
            .region()
            .copy_to_slice(self.receiver.offset(), &mut self.scratch)?;

        if !self.receiver.validate()? {
            return Err(AgronaError::InvalidArgument(
                "record was overwritten before it could be validated".to_string(),
            ));
        }

        handler(type_id, &self.scratch);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;

    fn region_pair(capacity: usize) -> (ByteRegion, ByteRegion) {
        let region = ByteRegion::new_heap(capacity + TRAILER_LENGTH, ByteOrder::Native).unwrap();
        (region.clone(), region)
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let region = ByteRegion::new_heap(777 + TRAILER_LENGTH, ByteOrder::Native).unwrap();
        assert!(matches!(
            BroadcastTransmitter::new(region, 777),
            Err(AgronaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn s1_first_message_observed_in_full() {
        let (writer_region, reader_region) = region_pair(1024);
        let tx = BroadcastTransmitter::new(writer_region, 1024).unwrap();
        let mut rx = BroadcastReceiver::new(reader_region, 1024).unwrap();

        let payload: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        tx.transmit(7, &payload).unwrap();

        assert!(rx.receive_next().unwrap());
        assert_eq!(rx.type_id().unwrap(), 7);
        assert_eq!(rx.length().unwrap(), 8);
        let mut buf = [0u8; 8];
        rx.region().copy_to_slice(rx.offset(), &mut buf).unwrap();
        assert_eq!(buf, payload);
        assert!(rx.validate().unwrap());
        assert_eq!(rx.lapped_count(), 0);
    }

    #[test]
    fn invariant_1_sequence_observed_in_order() {
        let (writer_region, reader_region) = region_pair(4096);
        let tx = BroadcastTransmitter::new(writer_region, 4096).unwrap();
        let mut rx = BroadcastReceiver::new(reader_region, 4096).unwrap();

        for i in 0..16u8 {
            tx.transmit(100 + i as i32, &[i; 4]).unwrap();
        }
        for i in 0..16u8 {
            assert!(rx.receive_next().unwrap());
            assert_eq!(rx.type_id().unwrap(), 100 + i as i32);
            let mut buf = [0u8; 4];
            rx.region().copy_to_slice(rx.offset(), &mut buf).unwrap();
            assert_eq!(buf, [i; 4]);
        }
        assert_eq!(rx.lapped_count(), 0);
        assert!(!rx.receive_next().unwrap());
    }

    #[test]
    fn invariant_2_lap_resyncs_to_latest() {
        let (writer_region, reader_region) = region_pair(128);
        let tx = BroadcastTransmitter::new(writer_region, 128).unwrap();
        let mut rx = BroadcastReceiver::new(reader_region, 128).unwrap();

        // Each record occupies 16 bytes (8 header + 8 payload), so 16 records wrap the
        // 128-byte body twice over before the reader ever polls.
        for i in 0..16u8 {
            tx.transmit(1, &[i; 8]).unwrap();
        }

        assert!(rx.receive_next().unwrap());
        assert!(rx.lapped_count() >= 1);
        // After resync the delivered record must be the current latest, not stale data.
        assert_eq!(rx.type_id().unwrap(), 1);
        let mut buf = [0u8; 8];
        rx.region().copy_to_slice(rx.offset(), &mut buf).unwrap();
        assert_eq!(buf, [15u8; 8]);
    }

    #[test]
    fn transmit_rejects_bad_type_id_and_oversize_payload() {
        let region = ByteRegion::new_heap(1024 + TRAILER_LENGTH, ByteOrder::Native).unwrap();
        let tx = BroadcastTransmitter::new(region, 1024).unwrap();
        assert!(matches!(
            tx.transmit(0, &[1, 2, 3]),
            Err(AgronaError::InvalidArgument(_))
        ));
        let oversize = vec![0u8; tx.max_msg_length() + 1];
        assert!(matches!(
            tx.transmit(1, &oversize),
            Err(AgronaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn copy_broadcast_receiver_delivers_payload() {
        let (writer_region, reader_region) = region_pair(1024);
        let tx = BroadcastTransmitter::new(writer_region, 1024).unwrap();
        let rx = BroadcastReceiver::new(reader_region, 1024).unwrap();
        let mut copy_rx = CopyBroadcastReceiver::new(rx);

        tx.transmit(42, b"hello").unwrap();

        let mut seen = None;
        let delivered = copy_rx
            .receive(|type_id, payload| seen = Some((type_id, payload.to_vec())))
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(seen, Some((42, b"hello".to_vec())));
    }
}
