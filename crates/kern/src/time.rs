// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's notion of time: a monotonic tick counter.

use sos_abi::CLOCK_FREQ;

/// The simulation's global tick counter. Every instruction executed and
/// every context-switch cost (`SAVE_LOAD_TIME`) advances it; PCB starvation
/// statistics are all expressed relative to it.
///
/// `freq` defaults to `sos_abi::CLOCK_FREQ` but is overridable from a
/// [`crate::config::SosConfig`] via [`Clock::set_freq`], so a harness can
/// vary the clock-interrupt period without recompiling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clock {
    ticks: u64,
    freq: u32,
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            ticks: 0,
            freq: CLOCK_FREQ,
        }
    }

    pub fn now(&self) -> u64 {
        self.ticks
    }

    pub fn advance(&mut self, ticks: u32) {
        self.ticks += u64::from(ticks);
    }

    pub fn tick(&mut self) {
        self.advance(1);
    }

    pub fn set_freq(&mut self, freq: u32) {
        self.freq = freq;
    }

    /// Whether the current tick is a clock-interrupt boundary.
    pub fn is_clock_tick(&self) -> bool {
        self.ticks % u64::from(self.freq) == 0
    }
}
