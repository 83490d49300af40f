// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-producer, single-consumer ring buffer with contiguous variable-length records.
//!
//! Producers claim space via a CAS loop on `tail`; the single consumer drains strictly
//! in claim order. A record's header carries its length twice in spirit: first a
//! negative preview that blocks the consumer while the producer copies its payload,
//! then the positive value that commits it.
//!
//! Header sub-fields (`length`, `typeId`) are always read/written through the atomic
//! accessors, even in places the design only requires a plain access — this keeps their
//! bit pattern natively encoded, which [`RingBuffer::unblock`] depends on to convert a
//! stalled claim into a padding record with one atomic 8-byte compare-and-set instead of
//! two independent 32-bit writes a reader could observe torn.

use crate::buffer::{align, check_capacity, ByteRegion, CACHE_LINE_LENGTH};
use crate::diagnostics::{trace_op, warn_event};
use crate::error::{AgronaError, Result};

/// Trailer and record layout offsets. Bit-exact; must match any other implementation
/// sharing this region.
pub mod layout {
    use super::CACHE_LINE_LENGTH;

    /// Offset of the end of the most recently claimed record.
    pub const TAIL_OFFSET: usize = 0;
    /// Offset of the producer-side cached copy of `head`.
    pub const HEAD_CACHE_OFFSET: usize = CACHE_LINE_LENGTH;
    /// Offset of the index of the next record the consumer will read.
    pub const HEAD_OFFSET: usize = CACHE_LINE_LENGTH * 2;
    /// Offset of a free-running correlation-id counter (unused by the core protocol,
    /// but its placement is part of the external layout contract).
    pub const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 3;
    /// Offset of the consumer's last heartbeat timestamp (unused by the core protocol;
    /// same caveat as above).
    pub const CONSUMER_HEARTBEAT_OFFSET: usize = CACHE_LINE_LENGTH * 4;
    /// Total trailer length.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 5;

    /// Record header: `int32 length` then `int32 typeId`.
    pub const HEADER_LENGTH: usize = 8;
    /// Records are aligned to the header length.
    pub const ALIGNMENT: usize = HEADER_LENGTH;
    /// `typeId` reserved for padding records.
    pub const PADDING_MSG_TYPE_ID: i32 = -1;
}

use layout::*;

fn header_bytes(length: i32, type_id: i32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&length.to_ne_bytes());
    bytes[4..8].copy_from_slice(&type_id.to_ne_bytes());
    bytes
}

/// A many-to-one ring buffer. Cheap to clone: clones share the same backing region,
/// which is how producer and consumer handles are distributed to their respective
/// threads.
#[derive(Clone)]
pub struct RingBuffer {
    region: ByteRegion,
    capacity: usize,
}

impl RingBuffer {
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

    /// Capacity of the buffer's body, excluding the trailer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload this buffer can carry in a single record.
    #[must_use]
    pub fn max_msg_length(&self) -> usize {
        self.capacity / 8
    }

    #[inline]
    fn trailer_offset(&self, field: usize) -> usize {
        self.capacity + field
    }

    fn check_msg_length(&self, length: usize) -> Result<()> {
        if length > self.max_msg_length() {
            return Err(AgronaError::InvalidArgument(format!(
                "payload length {length} exceeds max {}",
                self.max_msg_length()
            )));
        }
        Ok(())
    }

    fn read_length(&self, record_offset: usize) -> Result<i32> {
        self.region.load_acquire_i32(record_offset)
    }

    fn read_type_id(&self, record_offset: usize) -> Result<i32> {
        self.region.load_acquire_i32(record_offset + 4)
    }

    fn write_type_id(&self, record_offset: usize, type_id: i32) -> Result<()> {
        self.region.store_release_i32(record_offset + 4, type_id)
    }

    fn commit_length(&self, record_offset: usize, length: i32) -> Result<()> {
        self.region.store_release_i32(record_offset, length)
    }

    /// A free-running counter useful for correlating requests with responses sent back
    /// over a different channel. Callers that don't need it can ignore it entirely.
    pub fn next_correlation_id(&self) -> Result<i64> {
        self.region
            .get_and_add_i64(self.trailer_offset(CORRELATION_COUNTER_OFFSET), 1)
    }

    /// The consumer's last recorded heartbeat time (milliseconds since epoch), `0` if
    /// never set.
    pub fn consumer_heartbeat(&self) -> Result<i64> {
        self.region
            .load_acquire_i64(self.trailer_offset(CONSUMER_HEARTBEAT_OFFSET))
    }

    /// Record a consumer heartbeat, used by external liveness monitors.
    pub fn set_consumer_heartbeat(&self, epoch_millis: i64) -> Result<()> {
        self.region
            .store_release_i64(self.trailer_offset(CONSUMER_HEARTBEAT_OFFSET), epoch_millis)
    }

    /// Claim `required` bytes of body space for a record, returning the offset to write
    /// the header at, or `None` if there is currently insufficient space.
    ///
    /// Writes and commits a padding record itself when the claim wraps past the end of
    /// the body, returning `0` as the claimed offset in that case.
    fn claim_capacity(&self, required: usize) -> Result<Option<usize>> {
        let mask = self.capacity - 1;
        let mut head = self
            .region
            .get_i64(self.trailer_offset(HEAD_CACHE_OFFSET))?;

        loop {
            let tail = self
                .region
                .load_acquire_i64(self.trailer_offset(TAIL_OFFSET))?;
            let mut available = self.capacity as i64 - (tail - head);

            if required as i64 > available {
                head = self
                    .region
                    .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
                available = self.capacity as i64 - (tail - head);
                if required as i64 > available {
                    return Ok(None);
                }
                self.region
                    .store_release_i64(self.trailer_offset(HEAD_CACHE_OFFSET), head)?;
            }

            let mut padding = 0i64;
            let mut record_offset = (tail as usize) & mask;
            let to_buffer_end = self.capacity - record_offset;

            if required > to_buffer_end {
                let mut head_index = (head as usize) & mask;
                if required > head_index {
                    head = self
                        .region
                        .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
                    head_index = (head as usize) & mask;
                    if required > head_index {
                        return Ok(None);
                    }
                    self.region
                        .store_release_i64(self.trailer_offset(HEAD_CACHE_OFFSET), head)?;
                }
                padding = to_buffer_end as i64;
            }

            let claimed = self.region.cas_i64(
                self.trailer_offset(TAIL_OFFSET),
                tail,
                tail + required as i64 + padding,
            )?;
            if !claimed {
                continue;
            }

            if padding != 0 {
                self.write_type_id(record_offset, PADDING_MSG_TYPE_ID)?;
                self.commit_length(record_offset, padding as i32)?;
                record_offset = 0;
            }
            return Ok(Some(record_offset));
        }
    }

    /// Enqueue `payload` tagged with `type_id` (must be `>= 1`). Returns `false` (no
    /// mutation of `tail`) if there is currently insufficient space.
    pub fn write(&self, type_id: i32, payload: &[u8]) -> Result<bool> {
        if type_id < 1 {
            return Err(AgronaError::InvalidArgument(format!(
                "typeId must be >= 1, got {type_id}"
            )));
        }
        self.check_msg_length(payload.len())?;

        let record_length = HEADER_LENGTH + payload.len();
        let required = align(record_length, ALIGNMENT);

        let record_offset = match self.claim_capacity(required)? {
            Some(offset) => offset,
            None => {
                trace_op!("ring buffer write rejected, no space for {required} bytes");
                return Ok(false);
            }
        };

        self.write_type_id(record_offset, type_id)?;
        self.commit_length(record_offset, -(record_length as i32))?;
        self.region
            .copy_from_slice(record_offset + HEADER_LENGTH, payload)?;
        self.commit_length(record_offset, record_length as i32)?;
        trace_op!("ring buffer wrote typeId={type_id} at offset={record_offset} length={record_length}");

        Ok(true)
    }

    /// Drain up to `message_count_limit` committed records, invoking `handler(typeId,
    /// region, payload_offset, payload_length)` for each. Returns the number of messages
    /// delivered.
    ///
    /// If `handler` returns an error, bytes already scanned this call are still zeroed
    /// and `head` still advances past them before the error is propagated.
    pub fn read_n<F>(&self, mut handler: F, message_count_limit: usize) -> Result<usize>
    where
        F: FnMut(i32, &ByteRegion, usize, usize) -> Result<()>,
    {
        let mask = self.capacity - 1;
        let head = self
            .region
            .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
        let head_index = (head as usize) & mask;
        let contiguous_block_length = self.capacity - head_index;

        let mut messages_read = 0usize;
        let mut bytes_read = 0usize;
        let mut handler_error = None;

        while bytes_read < contiguous_block_length && messages_read < message_count_limit {
            let record_offset = head_index + bytes_read;
            let length = self.read_length(record_offset)?;
            if length <= 0 {
                break;
            }
            bytes_read += align(length as usize, ALIGNMENT);

            let type_id = self.read_type_id(record_offset)?;
            if type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            let payload_offset = record_offset + HEADER_LENGTH;
            let payload_length = length as usize - HEADER_LENGTH;
            if let Err(e) = handler(type_id, &self.region, payload_offset, payload_length) {
                handler_error = Some(e);
                break;
            }
        }

        if bytes_read != 0 {
            self.region.set_memory(head_index, bytes_read, 0)?;
            self.region
                .store_release_i64(self.trailer_offset(HEAD_OFFSET), head + bytes_read as i64)?;
        }

        match handler_error {
            Some(e) => Err(e),
            None => Ok(messages_read),
        }
    }

    /// Drain every currently-committed record. Equivalent to `read_n(handler,
    /// usize::MAX)`.
    pub fn read<F>(&self, handler: F) -> Result<usize>
    where
        F: FnMut(i32, &ByteRegion, usize, usize) -> Result<()>,
    {
        self.read_n(handler, usize::MAX)
    }

    /// Current number of unread bytes, clamped to `capacity`. Transiently may appear to
    /// exceed `capacity` by up to one record's worth due to the claim-then-write
    /// sequence; this is where that is clamped away.
    pub fn size(&self) -> Result<i64> {
        let mut head = self
            .region
            .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
        loop {
            let tail = self
                .region
                .load_acquire_i64(self.trailer_offset(TAIL_OFFSET))?;
            let head_after = self
                .region
                .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
            if head == head_after {
                return Ok((tail - head_after).min(self.capacity as i64));
            }
            head = head_after;
        }
    }

    /// Recover from a producer that CAS-advanced `tail` but has not (yet, or ever)
    /// committed its record, which would otherwise stall the consumer forever. Returns
    /// `false` if `head == tail` (nothing to unblock) or if a racing producer's commit
    /// was observed mid-scan (safer to let the consumer proceed normally next time).
    pub fn unblock(&self) -> Result<bool> {
        let head = self
            .region
            .load_acquire_i64(self.trailer_offset(HEAD_OFFSET))?;
        let tail = self
            .region
            .load_acquire_i64(self.trailer_offset(TAIL_OFFSET))?;
        if head == tail {
            return Ok(false);
        }

        let mask = self.capacity - 1;
        let head_index = (head as usize) & mask;

        let length1 = self.read_length(head_index)?;
        if length1 < 0 {
            // Re-check before mutating: a producer that finishes committing between our
            // two reads must win, not us.
            let length2 = self.read_length(head_index)?;
            if length1 != length2 {
                return Ok(false);
            }
            let type_id = self.read_type_id(head_index)?;
            let expected = header_bytes(length1, type_id);
            let converted = header_bytes(-length1, PADDING_MSG_TYPE_ID);
            let converted_ok = self.region.cas_bytes8(head_index, expected, converted)?;
            if converted_ok {
                warn_event!("ring buffer unblocked a stalled claim at head={head_index}, converted {length1} bytes to padding");
            }
            return Ok(converted_ok);
        }

        // The slot at `head` is not itself blocked; some producer claimed further ahead
        // and left a gap. Walk forward in cache-line steps looking for the first
        // committed record, then paper over the gap with one padding record.
        let mut probe = head + CACHE_LINE_LENGTH as i64;
        let mut gap_end = tail;
        while probe < tail {
            let idx = (probe as usize) & mask;
            let len1 = self.read_length(idx)?;
            let len2 = self.read_length(idx)?;
            if len1 != len2 {
                return Ok(false);
            }
            if len1 > 0 {
                gap_end = probe;
                break;
            }
            probe += CACHE_LINE_LENGTH as i64;
        }

        let gap_len = (gap_end - head) as i32;
        if gap_len <= 0 {
            return Ok(false);
        }
        self.write_type_id(head_index, PADDING_MSG_TYPE_ID)?;
        self.commit_length(head_index, gap_len)?;
        warn_event!("ring buffer unblocked a gap of {gap_len} bytes at head={head_index}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;

    fn shared_ring(capacity: usize) -> RingBuffer {
        let region = ByteRegion::new_heap(capacity + TRAILER_LENGTH, ByteOrder::Native).unwrap();
        RingBuffer::new(region, capacity).unwrap()
    }

    #[test]
    fn s2_rejects_non_power_of_two_capacity() {
        let region = ByteRegion::new_heap(777 + TRAILER_LENGTH, ByteOrder::Native).unwrap();
        assert!(matches!(
            RingBuffer::new(region, 777),
            Err(AgronaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn write_then_read_round_trip() {
        let ring = shared_ring(1024);
        assert!(ring.write(7, b"hello").unwrap());

        let mut seen = Vec::new();
        let read = ring
            .read(|type_id, region, offset, len| {
                let mut buf = vec![0u8; len];
                region.copy_to_slice(offset, &mut buf)?;
                seen.push((type_id, buf));
                Ok(())
            })
            .unwrap();
        assert_eq!(read, 1);
        assert_eq!(seen, vec![(7, b"hello".to_vec())]);
    }

    #[test]
    fn s3_padding_written_at_wrap() {
        // Capacity 4096; fill and drain records totaling exactly 4088 bytes so head and
        // tail land 8 bytes short of the end, then force a wrap with a 200-byte payload.
        let ring = shared_ring(4096);

        for _ in 0..7 {
            assert!(ring.write(1, &vec![0u8; 504]).unwrap());
        }
        assert!(ring.write(1, &vec![0u8; 496]).unwrap());
        ring.read(|_type_id, _region, _offset, _len| Ok(())).unwrap();

        let tail = ring
            .region
            .load_acquire_i64(ring.trailer_offset(TAIL_OFFSET))
            .unwrap();
        let head = ring
            .region
            .load_acquire_i64(ring.trailer_offset(HEAD_OFFSET))
            .unwrap();
        assert_eq!((head, tail), (4088, 4088));

        let payload = vec![0xABu8; 200];
        assert!(ring.write(99, &payload).unwrap());

        assert_eq!(ring.read_length(4088).unwrap(), 8);
        assert_eq!(ring.read_type_id(4088).unwrap(), PADDING_MSG_TYPE_ID);
        assert_eq!(ring.read_length(0).unwrap(), 208);
        assert_eq!(ring.read_type_id(0).unwrap(), 99);

        let new_tail = ring
            .region
            .load_acquire_i64(ring.trailer_offset(TAIL_OFFSET))
            .unwrap();
        assert_eq!(new_tail, 4088 + 8 + 208);

        let mut records = Vec::new();
        for _ in 0..2 {
            ring.read(|type_id, region, offset, len| {
                let mut buf = vec![0u8; len];
                region.copy_to_slice(offset, &mut buf)?;
                records.push((type_id, buf));
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(records, vec![(99, payload)]);
    }

    #[test]
    fn invariant_4_unblock_is_noop_when_head_equals_tail() {
        let ring = shared_ring(1024);
        assert!(!ring.unblock().unwrap());
    }

    #[test]
    fn invariant_4_unblock_converts_stalled_claim_to_padding() {
        let ring = shared_ring(1024);
        // Simulate a producer that claimed space and wrote a negative (uncommitted)
        // length header but crashed before committing.
        let required = align(HEADER_LENGTH + 32, ALIGNMENT);
        let offset = ring.claim_capacity(required).unwrap().unwrap();
        ring.write_type_id(offset, 5).unwrap();
        ring.commit_length(offset, -((HEADER_LENGTH + 32) as i32)).unwrap();

        assert!(ring.unblock().unwrap());

        let read = ring
            .read(|_type_id, _region, _offset, _len| Ok(()))
            .unwrap();
        assert_eq!(read, 0, "the converted slot must be skipped as padding");
    }

    #[test]
    fn rejects_oversize_payload_and_bad_type_id() {
        let ring = shared_ring(1024);
        assert!(matches!(
            ring.write(0, b"x"),
            Err(AgronaError::InvalidArgument(_))
        ));
        let oversize = vec![0u8; ring.max_msg_length() + 1];
        assert!(matches!(
            ring.write(1, &oversize),
            Err(AgronaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn handler_error_still_advances_head_past_failing_message() {
        let ring = shared_ring(1024);
        ring.write(1, b"first").unwrap();
        ring.write(2, b"second").unwrap();

        let mut seen = 0;
        let result = ring.read(|_type_id, _region, _offset, _len| {
            seen += 1;
            if seen == 1 {
                Ok(())
            } else {
                Err(AgronaError::InvalidArgument("handler failed".to_string()))
            }
        });
        assert!(result.is_err());
        assert_eq!(ring.size().unwrap(), 0);
    }

    #[test]
    fn invariant_3_multiple_producers_preserve_per_producer_order() {
        use std::sync::Arc;
        use std::thread;

        let ring = shared_ring(1 << 16);
        let ring = Arc::new(ring);
        let producers = 4;
        let per_producer = 64;

        let mut handles = Vec::new();
        for p in 0..producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let payload = [(p * per_producer + i) as u8; 4];
                    while !ring.write(p as i32 + 1, &payload).unwrap() {
                        thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut last_seen = vec![-1i32; producers];
        let mut total = 0;
        ring.read(|type_id, region, offset, len| {
            let mut buf = vec![0u8; len];
            region.copy_to_slice(offset, &mut buf)?;
            let p = (type_id - 1) as usize;
            let value = buf[0] as i32;
            assert!(value > last_seen[p], "producer {p} messages out of order");
            last_seen[p] = value;
            total += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(total, producers * per_producer);
    }
}
