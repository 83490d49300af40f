// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # agrona
//!
//! Off-heap, allocation-free, lock-free data structures for high-throughput inter-thread
//! and inter-process communication, built on a raw byte region with a cache-line-aligned
//! trailer of control counters.
//!
//! ## Components
//!
//! - [`broadcast`] — single-writer, many-reader fan-out with overwrite semantics and
//!   explicit loss (lap) detection.
//! - [`ringbuffer`] — multi-producer, single-consumer FIFO with contiguous records and a
//!   consumer-driven recovery (`unblock`) protocol.
//! - [`errorlog`] — an append-only log that coalesces repeated errors by identity into
//!   aggregated observation records.
//! - [`counters`] — managed allocation, reuse, and iteration of named counters backed by
//!   parallel values/metadata regions.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------------------------+
//! |                     BroadcastTransmitter / RingBuffer                 |
//! |         (component-specific trailer layout + claim/publish logic)     |
//! +-----------------------------------------------------------------------+
//! |                             ByteRegion                                |
//! |   bounds-checked primitive access | atomics (acquire/release/CAS)     |
//! |   byte-order-aware codecs | alignment verification | fences          |
//! +-----------------------------------------------------------------------+
//! |                           BufferBacking                                |
//! |              HeapBuffer (in-process)  |  ShmSegment (IPC, `shm`)       |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! Every component shares the same discipline: a fixed layout on a raw byte region,
//! inter-process visibility through shared memory when backed by [`shm::ShmSegment`],
//! explicit memory-ordering rules, and no allocation on the hot path.
//!
//! ## Quick start
//!
//! ```
//! use agrona::buffer::{ByteOrder, ByteRegion};
//! use agrona::ringbuffer::RingBuffer;
//!
//! let region = ByteRegion::new_heap(4096, ByteOrder::Native)?;
//! let ring = RingBuffer::new(region, 2048)?;
//!
//! ring.write(1, b"hello")?;
//! ring.read(|type_id, buf, offset, length| {
//!     assert_eq!(type_id, 1);
//!     let mut payload = vec![0u8; length];
//!     buf.copy_to_slice(offset, &mut payload)?;
//!     assert_eq!(payload, b"hello");
//!     Ok(())
//! })?;
//! # Ok::<(), agrona::error::AgronaError>(())
//! ```

pub mod broadcast;
pub mod buffer;
pub mod clock;
pub mod counters;
mod diagnostics;
pub mod error;
pub mod errorlog;
pub mod ringbuffer;

#[cfg(feature = "shm")]
pub mod shm;

pub use broadcast::{BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver};
pub use buffer::{ByteOrder, ByteRegion};
pub use clock::{EpochClock, SystemEpochClock};
pub use counters::{CounterState, CountersManager, CountersReader};
pub use error::{AgronaError, Result};
pub use errorlog::{DistinctErrorLog, ErrorIdentity};
pub use ringbuffer::RingBuffer;

#[cfg(feature = "shm")]
pub use shm::ShmSegment;
