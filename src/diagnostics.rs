// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Internal logging call sites, gated by the `logging`/`trace` Cargo features so the hot
//! path compiles to nothing when neither is enabled, rather than relying solely on the
//! `log` crate's runtime level filter.

macro_rules! trace_op {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace")]
        log::trace!($($arg)*);
    };
}

macro_rules! debug_event {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::debug!($($arg)*);
    };
}

macro_rules! warn_event {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::warn!($($arg)*);
    };
}

pub(crate) use debug_event;
pub(crate) use trace_op;
pub(crate) use warn_event;
