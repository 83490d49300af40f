// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Epoch millisecond clock abstraction consumed by the distinct error log.

use crate::error::{AgronaError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of milliseconds-since-epoch timestamps.
///
/// Implementations may fail (a faulty hardware clock, a `SystemTime` before `UNIX_EPOCH`),
/// in which case the fault propagates to the caller rather than being papered over.
pub trait EpochClock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> Result<i64>;
}

/// The default clock, backed by [`std::time::SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn now_millis(&self) -> Result<i64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .map_err(|e| AgronaError::ClockFault(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_non_decreasing() {
        let clock = SystemEpochClock;
        let t0 = clock.now_millis().unwrap();
        let t1 = clock.now_millis().unwrap();
        assert!(t1 >= t0);
    }
}
