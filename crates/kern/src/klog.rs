// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured kernel-event logging.
//!
//! The kernel never installs a logger itself; it only ever calls through
//! the `log` crate's facade macros. Whoever embeds this kernel (a test
//! harness, a demo binary) is responsible for configuring a subscriber.

/// Logs a kernel event at debug level, tagged with the module it came from.
///
/// This is a thin wrapper over `log::debug!` rather than a direct call so
/// that kernel call sites read the same regardless of which logging crate
/// backs them, and so the level can be centrally promoted if a particular
/// class of event (faults, compaction) turns out to need `warn!` instead.
macro_rules! klog {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

pub(crate) use klog;
