// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! `NoSpace`, `Lapped`, and `Invalidated` outcomes from the spec are deliberately *not*
//! represented here: they are ordinary (non-exceptional) results, returned as `bool`s or
//! small per-component result enums from the operations that produce them.

use std::fmt;
use std::io;

/// Errors surfaced by the buffers in this crate.
///
/// These are always programmer/environment errors (bad arguments, corrupt/misaligned
/// memory, a failing clock) — never ordinary "no space"/"no data" outcomes, which are
/// returned as plain values from the operation that observed them.
#[derive(Debug)]
pub enum AgronaError {
    /// A precondition on an argument was violated (`typeId < 1`, oversize payload, label
    /// too long, capacity not a power of two, an unrecognized byte order, ...).
    InvalidArgument(String),
    /// An offset/length passed to a [`crate::buffer::ByteRegion`] accessor falls outside
    /// its capacity.
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },
    /// The region's base address is not 8-byte aligned, discovered at construction time.
    UnalignedAccess { address: usize },
    /// The epoch clock supplied to a component raised an error.
    ClockFault(String),
    /// A shared-memory segment could not be created.
    SegmentCreate(io::Error),
    /// A shared-memory segment could not be opened.
    SegmentOpen(io::Error),
    /// `mmap` of a shared-memory segment failed.
    Mmap(io::Error),
    /// A segment name did not satisfy POSIX shared-memory naming rules.
    InvalidName(String),
    /// A named shared-memory segment does not exist.
    NotFound(String),
}

impl fmt::Display for AgronaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::OutOfBounds {
                offset,
                length,
                capacity,
            } => write!(
                f,
                "out of bounds: offset={offset} length={length} capacity={capacity}"
            ),
            Self::UnalignedAccess { address } => {
                write!(f, "region base 0x{address:x} is not 8-byte aligned")
            }
            Self::ClockFault(msg) => write!(f, "clock fault: {msg}"),
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
        }
    }
}

impl std::error::Error for AgronaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, AgronaError>;
