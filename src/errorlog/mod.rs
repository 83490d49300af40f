// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Append-only log that coalesces repeated errors into aggregated observation records.
//!
//! There is no true exception type to key coalescing off of once an error crosses into
//! this crate's abstract core — see [`ErrorIdentity`], which callers implement to supply
//! a stable `(kind name, message, cause chain)` fingerprint instead.

use crate::buffer::{align, ByteRegion, CACHE_LINE_LENGTH};
use crate::clock::EpochClock;
use crate::diagnostics::{debug_event, warn_event};
use crate::error::{AgronaError, Result};
use std::sync::Arc;

/// Record layout offsets. Bit-exact; must match any other implementation sharing this
/// region.
pub mod layout {
    use super::CACHE_LINE_LENGTH;

    pub const LENGTH_OFFSET: usize = 0;
    pub const OBSERVATION_COUNT_OFFSET: usize = 4;
    pub const FIRST_TIMESTAMP_OFFSET: usize = 8;
    pub const LAST_TIMESTAMP_OFFSET: usize = 16;
    pub const ENCODED_OFFSET: usize = 24;
    pub const HEADER_LENGTH: usize = 24;
    /// Records are aligned to a cache line.
    pub const RECORD_ALIGNMENT: usize = CACHE_LINE_LENGTH;
}

use layout::*;

/// A caller-supplied view onto an error's identity, used both to render the persisted
/// record and to decide whether two observations should coalesce.
///
/// Two errors are the same distinct error iff `kind_name()`, `message()`, and every
/// level of `cause()` match in sequence — there is no reflection or stack-frame capture
/// in this core; callers that want frame info encode it into `message()` themselves.
pub trait ErrorIdentity {
    /// A stable discriminator for the error's kind (e.g. a type name).
    fn kind_name(&self) -> &str;
    /// The error's message.
    fn message(&self) -> &str;
    /// The next error in the cause chain, if any.
    fn cause(&self) -> Option<&dyn ErrorIdentity>;
}

fn encode_chain(error: &dyn ErrorIdentity) -> Vec<u8> {
    let mut out = String::new();
    let mut current: Option<&dyn ErrorIdentity> = Some(error);
    let mut first = true;
    while let Some(e) = current {
        if !first {
            out.push_str("\nCaused by: ");
        }
        out.push_str(e.kind_name());
        out.push_str(": ");
        out.push_str(e.message());
        first = false;
        current = e.cause();
    }
    out.into_bytes()
}

/// An append-only, identity-coalescing error log over a raw byte region.
pub struct DistinctErrorLog {
    region: ByteRegion,
    clock: Arc<dyn EpochClock>,
}

impl DistinctErrorLog {
    /// Wrap the whole of `region` as log storage, using `clock` for observation
    /// timestamps.
    #[must_use]
    pub fn new(region: ByteRegion, clock: Arc<dyn EpochClock>) -> Self {
        Self { region, clock }
    }

    /// Total capacity available to records.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Record one observation of `error`. If an existing record already matches its
    /// identity, only its `observationCount`/`lastTimestamp` are updated; otherwise a
    /// new record is appended. Returns `false` if there is no remaining space.
    ///
    /// A fully packed log is detected by a length-only scan before `error`'s cause
    /// chain is ever encoded, so a caller hammering a full log never pays for encoding
    /// work that can't be stored.
    pub fn record(&self, error: &dyn ErrorIdentity) -> Result<bool> {
        if self.capacity() < HEADER_LENGTH {
            return Ok(false);
        }

        let mut free_offset = 0usize;
        while free_offset + HEADER_LENGTH <= self.capacity() {
            let length = self.region.load_acquire_i32(free_offset)?;
            if length == 0 {
                break;
            }
            free_offset += align(length as usize, RECORD_ALIGNMENT);
        }
        if free_offset + HEADER_LENGTH > self.capacity() {
            warn_event!("error log is completely full, rejecting record before encoding");
            return Ok(false);
        }

        let encoded = encode_chain(error);

        let mut offset = 0usize;
        while offset < free_offset {
            let length = self.region.load_acquire_i32(offset)?;
            let existing_len = length as usize - HEADER_LENGTH;
            if offset + HEADER_LENGTH + existing_len <= self.capacity() {
                let mut existing = vec![0u8; existing_len];
                self.region
                    .copy_to_slice(offset + ENCODED_OFFSET, &mut existing)?;
                if existing == encoded {
                    self.region
                        .get_and_add_i32(offset + OBSERVATION_COUNT_OFFSET, 1)?;
                    let now = self.clock.now_millis()?;
                    self.region
                        .store_release_i64(offset + LAST_TIMESTAMP_OFFSET, now)?;
                    debug_event!("error log coalesced an observation at offset={offset}");
                    return Ok(true);
                }
            }
            offset += align(length as usize, RECORD_ALIGNMENT);
        }

        let record_length = HEADER_LENGTH + encoded.len();
        if free_offset + record_length > self.capacity() {
            warn_event!("error log has insufficient remaining space for this distinct record");
            return Ok(false);
        }

        self.region.copy_from_slice(free_offset + ENCODED_OFFSET, &encoded)?;
        let first_now = self.clock.now_millis()?;
        self.region.put_i64(free_offset + FIRST_TIMESTAMP_OFFSET, first_now)?;
        self.region
            .store_release_i32(free_offset + LENGTH_OFFSET, record_length as i32)?;
        self.region
            .get_and_add_i32(free_offset + OBSERVATION_COUNT_OFFSET, 1)?;
        let last_now = self.clock.now_millis()?;
        self.region
            .store_release_i64(free_offset + LAST_TIMESTAMP_OFFSET, last_now)?;
        debug_event!(
            "error log appended a new distinct record at offset={free_offset}, length={record_length}"
        );
        Ok(true)
    }

    /// Iterate committed records with `lastTimestamp >= since_timestamp` in offset
    /// order, invoking `consumer(observationCount, firstTimestamp, lastTimestamp,
    /// message)`. Returns the number of records visited.
    pub fn for_each<F>(&self, since_timestamp: i64, mut consumer: F) -> Result<usize>
    where
        F: FnMut(i32, i64, i64, &str) -> Result<()>,
    {
        let mut offset = 0usize;
        let mut visited = 0usize;
        while offset + HEADER_LENGTH <= self.capacity() {
            let length = self.region.load_acquire_i32(offset)?;
            if length == 0 {
                break;
            }
            let last_timestamp = self.region.load_acquire_i64(offset + LAST_TIMESTAMP_OFFSET)?;
            if last_timestamp >= since_timestamp {
                let observation_count =
                    self.region.load_acquire_i32(offset + OBSERVATION_COUNT_OFFSET)?;
                let first_timestamp = self.region.get_i64(offset + FIRST_TIMESTAMP_OFFSET)?;
                let mut encoded = vec![0u8; length as usize - HEADER_LENGTH];
                self.region.copy_to_slice(offset + ENCODED_OFFSET, &mut encoded)?;
                let message = String::from_utf8(encoded).map_err(|e| {
                    AgronaError::InvalidArgument(format!("invalid utf-8 in error log: {e}"))
                })?;
                consumer(observation_count, first_timestamp, last_timestamp, &message)?;
                visited += 1;
            }
            offset += align(length as usize, RECORD_ALIGNMENT);
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;
    use crate::clock::SystemEpochClock;

    struct SimpleError {
        kind: &'static str,
        message: String,
    }

    impl ErrorIdentity for SimpleError {
        fn kind_name(&self) -> &str {
            self.kind
        }
        fn message(&self) -> &str {
            &self.message
        }
        fn cause(&self) -> Option<&dyn ErrorIdentity> {
            None
        }
    }

    struct FixedClock(std::sync::atomic::AtomicI64);

    impl EpochClock for FixedClock {
        fn now_millis(&self) -> Result<i64> {
            Ok(self.0.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    fn log(capacity: usize) -> (DistinctErrorLog, Arc<FixedClock>) {
        let region = ByteRegion::new_heap(capacity, ByteOrder::Native).unwrap();
        let clock = Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(0)));
        (DistinctErrorLog::new(region, clock.clone()), clock)
    }

    #[test]
    fn s4_two_observations_coalesce() {
        let (log_store, clock) = log(4096);
        let err = SimpleError {
            kind: "RuntimeException",
            message: "Test".to_string(),
        };

        clock.0.store(7, std::sync::atomic::Ordering::SeqCst);
        assert!(log_store.record(&err).unwrap());
        clock.0.store(10, std::sync::atomic::Ordering::SeqCst);
        assert!(log_store.record(&err).unwrap());

        let mut seen = Vec::new();
        log_store
            .for_each(0, |count, first, last, message| {
                seen.push((count, first, last, message.to_string()));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 2);
        assert_eq!(seen[0].1, 7);
        assert_eq!(seen[0].2, 10);
        assert!(seen[0].3.contains("Test"));
    }

    #[test]
    fn s5_distinct_errors_do_not_coalesce() {
        let (log_store, clock) = log(4096);

        clock.0.store(7, std::sync::atomic::Ordering::SeqCst);
        log_store
            .record(&SimpleError {
                kind: "RuntimeException",
                message: "A".to_string(),
            })
            .unwrap();
        clock.0.store(10, std::sync::atomic::Ordering::SeqCst);
        log_store
            .record(&SimpleError {
                kind: "IllegalStateException",
                message: "B".to_string(),
            })
            .unwrap();

        let mut seen = Vec::new();
        log_store
            .for_each(0, |count, first, last, message| {
                seen.push((count, first, last, message.to_string()));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, 7, 7, "RuntimeException: A".to_string()));
        assert_eq!(seen[1], (1, 10, 10, "IllegalStateException: B".to_string()));
    }

    #[test]
    fn invariant_5_timestamps_and_identity() {
        let (log_store, clock) = log(4096);
        let a = SimpleError {
            kind: "E",
            message: "a".to_string(),
        };
        let b = SimpleError {
            kind: "E",
            message: "b".to_string(),
        };
        for t in [1i64, 2, 3] {
            clock.0.store(t, std::sync::atomic::Ordering::SeqCst);
            log_store.record(&a).unwrap();
        }
        clock.0.store(5, std::sync::atomic::Ordering::SeqCst);
        log_store.record(&b).unwrap();

        let mut seen = Vec::new();
        log_store
            .for_each(0, |count, first, last, message| {
                seen.push((count, first, last, message.to_string()));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 3);
        assert!(seen[0].1 <= seen[0].2);
        assert_eq!(seen[1].0, 1);
    }

    #[test]
    fn since_timestamp_filters_stale_records() {
        let (log_store, clock) = log(4096);
        clock.0.store(1, std::sync::atomic::Ordering::SeqCst);
        log_store
            .record(&SimpleError {
                kind: "E",
                message: "old".to_string(),
            })
            .unwrap();
        clock.0.store(100, std::sync::atomic::Ordering::SeqCst);
        log_store
            .record(&SimpleError {
                kind: "E",
                message: "new".to_string(),
            })
            .unwrap();

        let mut seen = Vec::new();
        log_store
            .for_each(50, |_c, _f, _l, message| {
                seen.push(message.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["E: new".to_string()]);
    }

    #[test]
    fn real_clock_works_end_to_end() {
        let region = ByteRegion::new_heap(1024, ByteOrder::Native).unwrap();
        let log_store = DistinctErrorLog::new(region, Arc::new(SystemEpochClock));
        log_store
            .record(&SimpleError {
                kind: "E",
                message: "x".to_string(),
            })
            .unwrap();
        let mut count = 0;
        log_store
            .for_each(0, |_c, _f, _l, _m| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
