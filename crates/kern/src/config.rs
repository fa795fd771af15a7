// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative configuration for a simulation run.
//!
//! Static application shape (how big RAM is, which devices exist) is data,
//! not code: a harness builds or loads a `SosConfig` and hands it to
//! [`crate::sos::Sos::from_config`] rather than the kernel hardcoding these
//! knobs.

use serde::{Deserialize, Serialize};

use sos_abi::{DeviceCaps, CLOCK_FREQ};

/// Top-level configuration for a `Sos` instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SosConfig {
    /// Size of the simulated RAM array, in words.
    pub ram_size: usize,
    /// Instructions executed per clock tick. Defaults to spec's
    /// `CLOCK_FREQ` if omitted from a loaded config file.
    #[serde(default = "default_clock_freq")]
    pub clock_freq: u32,
    /// Devices to construct as built-in `SimpleDevice`s. Harnesses that
    /// supply their own driver implementations register those directly via
    /// `Sos::new`'s `devices` parameter instead of listing them here.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_clock_freq() -> u32 {
    CLOCK_FREQ
}

impl Default for SosConfig {
    fn default() -> Self {
        SosConfig {
            ram_size: 3000,
            clock_freq: CLOCK_FREQ,
            devices: Vec::new(),
        }
    }
}

/// Enough information to construct a `SimpleDevice` test/demo driver.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub caps: DeviceCaps,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_devices() {
        let cfg = SosConfig::default();
        assert_eq!(cfg.ram_size, 3000);
        assert_eq!(cfg.clock_freq, CLOCK_FREQ);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = SosConfig {
            ram_size: 4096,
            clock_freq: 5,
            devices: vec![DeviceConfig {
                id: 1,
                caps: DeviceCaps::READABLE | DeviceCaps::WRITEABLE,
            }],
        };
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: SosConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.ram_size, cfg.ram_size);
        assert_eq!(parsed.devices[0].id, 1);
        assert!(parsed.devices[0].caps.contains(DeviceCaps::READABLE));
        assert!(!parsed.devices[0].caps.contains(DeviceCaps::SHAREABLE));
    }

    #[test]
    fn missing_clock_freq_uses_default() {
        let cfg: SosConfig = toml::from_str("ram_size = 1000\n").expect("deserialize");
        assert_eq!(cfg.clock_freq, CLOCK_FREQ);
    }
}
