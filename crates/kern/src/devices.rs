// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry: maps device id to driver plus opener set, and
//! implements the OPEN/CLOSE blocking protocol.

use std::collections::{BTreeMap, BTreeSet};

use sos_abi::{status, BlockOp, BlockedFor, DeviceId, Pid, Word};

use crate::cpu::Device;
use crate::klog::klog;
use crate::task::ProcessTable;

/// A registered device plus the set of processes currently holding it open.
pub struct DeviceInfo {
    driver: Box<dyn Device>,
    openers: BTreeSet<Pid>,
}

impl DeviceInfo {
    pub fn id(&self) -> DeviceId {
        self.driver.id()
    }

    pub fn openers(&self) -> &BTreeSet<Pid> {
        &self.openers
    }

    pub fn is_shareable(&self) -> bool {
        self.driver.is_shareable()
    }

    pub fn is_readable(&self) -> bool {
        self.driver.is_readable()
    }

    pub fn is_writeable(&self) -> bool {
        self.driver.is_writeable()
    }

    pub fn is_available(&self) -> bool {
        self.driver.is_available()
    }
}

/// Owns every registered device. Devices are identified by `DeviceId` and
/// registration is expected to happen once, up front (spec.md §4.2 treats
/// `register` as a setup-time operation).
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceInfo>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver`. `id` must not already be registered.
    pub fn register(&mut self, driver: Box<dyn Device>) {
        let id = driver.id();
        let prior = self.devices.insert(
            id,
            DeviceInfo {
                driver,
                openers: BTreeSet::new(),
            },
        );
        assert!(prior.is_none(), "duplicate device id {id}");
    }

    pub fn find(&self, id: DeviceId) -> Option<&DeviceInfo> {
        self.devices.get(&id)
    }

    fn find_mut(&mut self, id: DeviceId) -> Option<&mut DeviceInfo> {
        self.devices.get_mut(&id)
    }

    /// Removes `pid` from every device's opener set. Called when a process
    /// is destroyed, so the registry never holds a dangling opener
    /// (invariant 4 in spec.md §8).
    pub fn forget_process(&mut self, pid: Pid) {
        for dev in self.devices.values_mut() {
            dev.openers.remove(&pid);
        }
    }

    /// Implements the `OPEN` syscall's device-side policy.
    ///
    /// Returns `Ok(true)` if the caller is now open on the device and
    /// runnable; `Ok(false)` if the caller should transition to BLOCKED
    /// (spec.md §4.2 notes SUCCESS is still the result word pushed at block
    /// time, interpreted by the caller once it becomes ready again); `Err`
    /// with the negative status code on an outright failure.
    pub fn open(&mut self, id: DeviceId, caller: Pid) -> Result<bool, Word> {
        let dev = self.find_mut(id).ok_or(status::ERROR_DEVICE_EXISTENCE)?;

        if dev.openers.contains(&caller) {
            return Err(status::ERROR_DEVICE_OPEN);
        }

        if dev.openers.is_empty() || dev.is_shareable() {
            dev.openers.insert(caller);
            klog!("device {id}: {caller} opened");
            Ok(true)
        } else {
            klog!("device {id}: {caller} blocked (held by another process)");
            Ok(false)
        }
    }

    /// Implements the `CLOSE` syscall. On success, returns the PID of a
    /// process that should be woken because it was blocked waiting to open
    /// this device, if any.
    pub fn close(
        &mut self,
        id: DeviceId,
        caller: Pid,
        processes: &ProcessTable,
    ) -> Result<Option<Pid>, Word> {
        let dev = self.find_mut(id).ok_or(status::ERROR_DEVICE_EXISTENCE)?;

        if !dev.openers.remove(&caller) {
            return Err(status::ERROR_DEVICE_NOT_OPEN);
        }
        klog!("device {id}: {caller} closed");

        let waiter = processes.find_blocked(|b| {
            b.device == id && b.op == BlockOp::Open
        });
        if let Some(pid) = waiter {
            klog!("device {id}: waking {pid}");
        }
        Ok(waiter)
    }

    /// Validates a `READ` request's preconditions (device exists, is
    /// readable, and caller has it open), without touching availability --
    /// the busy-retry decision is the dispatcher's, since it also needs to
    /// rewind the caller's PC.
    pub fn check_read(&self, id: DeviceId, caller: Pid) -> Result<(), Word> {
        let dev = self.find(id).ok_or(status::ERROR_DEVICE_EXISTENCE)?;
        if !dev.openers.contains(&caller) {
            return Err(status::ERROR_DEVICE_NOT_OPEN);
        }
        if !dev.is_readable() {
            return Err(status::ERROR_DEVICE_NOT_USABLE);
        }
        Ok(())
    }

    /// Validates a `WRITE` request's preconditions, mirroring `check_read`.
    pub fn check_write(&self, id: DeviceId, caller: Pid) -> Result<(), Word> {
        let dev = self.find(id).ok_or(status::ERROR_DEVICE_EXISTENCE)?;
        if !dev.openers.contains(&caller) {
            return Err(status::ERROR_DEVICE_NOT_OPEN);
        }
        if !dev.is_writeable() {
            return Err(status::ERROR_DEVICE_NOT_USABLE);
        }
        Ok(())
    }

    pub fn is_available(&self, id: DeviceId) -> Option<bool> {
        self.find(id).map(|d| d.is_available())
    }
}

/// Convenience constructor for a `BlockedFor` describing a blocked `OPEN`.
pub fn blocked_on_open(device: DeviceId) -> BlockedFor {
    BlockedFor {
        device,
        op: BlockOp::Open,
        addr: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::tests::SimpleDevice;

    fn registry_with(devices: Vec<SimpleDevice>) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        for d in devices {
            reg.register(Box::new(d));
        }
        reg
    }

    #[test]
    fn open_close_round_trip_on_unused_device() {
        let mut reg = registry_with(vec![SimpleDevice::new(1, false, true, true)]);
        let pid = Pid(1001);
        assert_eq!(reg.open(DeviceId(1), pid), Ok(true));
        assert_eq!(reg.find(DeviceId(1)).unwrap().openers().len(), 1);

        let table = ProcessTable::new();
        assert_eq!(reg.close(DeviceId(1), pid, &table), Ok(None));
        assert!(reg.find(DeviceId(1)).unwrap().openers().is_empty());
    }

    #[test]
    fn double_open_fails() {
        let mut reg = registry_with(vec![SimpleDevice::new(1, false, true, true)]);
        let pid = Pid(1001);
        assert_eq!(reg.open(DeviceId(1), pid), Ok(true));
        assert_eq!(reg.open(DeviceId(1), pid), Err(status::ERROR_DEVICE_OPEN));
    }

    #[test]
    fn close_without_open_fails() {
        let mut reg = registry_with(vec![SimpleDevice::new(1, false, true, true)]);
        let table = ProcessTable::new();
        assert_eq!(
            reg.close(DeviceId(1), Pid(1001), &table),
            Err(status::ERROR_DEVICE_NOT_OPEN)
        );
    }

    #[test]
    fn open_nonexistent_device_fails() {
        let mut reg = registry_with(vec![]);
        assert_eq!(
            reg.open(DeviceId(5), Pid(1001)),
            Err(status::ERROR_DEVICE_EXISTENCE)
        );
    }

    #[test]
    fn shareable_device_admits_multiple_openers() {
        let mut reg = registry_with(vec![SimpleDevice::new(2, true, true, false)]);
        assert_eq!(reg.open(DeviceId(2), Pid(1001)), Ok(true));
        assert_eq!(reg.open(DeviceId(2), Pid(1002)), Ok(true));
        assert_eq!(reg.find(DeviceId(2)).unwrap().openers().len(), 2);
    }

    #[test]
    fn non_shareable_second_opener_blocks() {
        let mut reg = registry_with(vec![SimpleDevice::new(1, false, true, true)]);
        assert_eq!(reg.open(DeviceId(1), Pid(1001)), Ok(true));
        assert_eq!(reg.open(DeviceId(1), Pid(1002)), Ok(false));
    }
}
