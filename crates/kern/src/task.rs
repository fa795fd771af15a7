// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process control block and process table.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use sos_abi::{BlockedFor, Pid, Registers, Word};
use unwrap_lite::UnwrapLite;

/// Scheduling state of a process, mirroring spec.md's three-state PCB
/// machine. `Blocked` carries the condition the process is waiting on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PcbState {
    Running,
    Ready,
    Blocked(BlockedFor),
}

impl PcbState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, PcbState::Blocked(_))
    }

    pub fn blocked_for(&self) -> Option<BlockedFor> {
        match self {
            PcbState::Blocked(b) => Some(*b),
            _ => None,
        }
    }
}

/// Per-process timing counters used by the starvation-aware scheduler.
///
/// These are updated exactly as described in spec.md §4.4: `save` (a
/// process leaving RUNNING) bumps `num_ready` and rolls the just-finished
/// run into `total_run_time`; `restore` (a process entering RUNNING)
/// updates the starvation statistics from the time spent READY.
#[derive(Copy, Clone, Debug, Default)]
pub struct Timing {
    pub last_ready_time: u64,
    pub num_ready: u64,
    pub max_starve: u64,
    pub avg_starve: f64,
    pub total_run_time: u64,
    pub last_start_time: u64,
    pub last_end_time: u64,
    pub avg_run_time: f64,
}

impl Timing {
    /// Called when a process is about to leave RUNNING (save).
    fn on_save(&mut self, now: u64) {
        self.last_end_time = now;
        self.total_run_time += self.last_end_time.saturating_sub(self.last_start_time);
        self.num_ready += 1;
        self.last_ready_time = now;
        if self.num_ready > 0 {
            self.avg_run_time = self.total_run_time as f64 / self.num_ready as f64;
        }
    }

    /// Called when a process is about to enter RUNNING (restore).
    fn on_restore(&mut self, now: u64) {
        let starve = now.saturating_sub(self.last_ready_time);
        self.max_starve = self.max_starve.max(starve);
        let n = self.num_ready.max(1) as f64;
        self.avg_starve = self.avg_starve * (n - 1.0) / n + starve as f64 / n;
        self.last_start_time = now;
    }
}

/// Process control block.
///
/// PCBs are ordered by `BASE` (per spec.md §3), which is what lets the
/// allocator's compaction pass and the device registry's FIFO scans walk
/// the table in a stable, meaningful order.
#[derive(Clone, Debug)]
pub struct Pcb {
    pid: Pid,
    registers: Registers,
    state: PcbState,
    timing: Timing,
}

impl Pcb {
    pub fn new(pid: Pid, registers: Registers) -> Self {
        Pcb {
            pid,
            registers,
            state: PcbState::Ready,
            timing: Timing::default(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn state(&self) -> PcbState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PcbState::Ready
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn base(&self) -> Word {
        self.registers.base
    }

    pub fn lim(&self) -> Word {
        self.registers.lim
    }

    /// Saves this process's registers (supplied by the caller, typically
    /// copied out of the live CPU) and transitions it to READY, updating
    /// starvation bookkeeping.
    pub fn save(&mut self, registers: Registers, now: u64) {
        self.registers = registers;
        self.state = PcbState::Ready;
        self.timing.on_save(now);
    }

    /// Transitions this process to RUNNING, updating starvation bookkeeping.
    /// Returns the registers to be loaded into the live CPU.
    pub fn restore(&mut self, now: u64) -> Registers {
        self.timing.on_restore(now);
        self.state = PcbState::Running;
        self.registers
    }

    /// Transitions this process to BLOCKED on `reason`. Must only be called
    /// on a process that is currently RUNNING (the dispatcher always blocks
    /// the caller of the syscall that triggers the block).
    pub fn block(&mut self, registers: Registers, reason: BlockedFor, now: u64) {
        self.registers = registers;
        self.state = PcbState::Blocked(reason);
        self.timing.on_save(now);
    }

    /// Transitions this process from BLOCKED to READY, leaving its saved
    /// registers untouched except for whatever the completion handler
    /// already wrote into them via `registers_mut`.
    pub fn unblock(&mut self) {
        debug_assert!(self.state.is_blocked());
        self.state = PcbState::Ready;
    }

    /// Relocates this process's memory window by shifting BASE, PC and SP
    /// by `new_base - old_base`. LIM is a window size, so it is unaffected.
    /// Used by the allocator's compaction pass.
    pub fn relocate(&mut self, new_base: Word) {
        let delta = new_base - self.registers.base;
        self.registers.base = new_base;
        self.registers.pc += delta;
        self.registers.sp += delta;
    }
}

impl PartialEq for Pcb {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}
impl Eq for Pcb {}

impl PartialOrd for Pcb {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pcb {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base().cmp(&other.base())
    }
}

/// Owns every live `Pcb`, keyed by PID, plus the PID counter from which new
/// processes are allocated.
///
/// A `BTreeMap` keeps iteration in PID order, which (since PIDs are handed
/// out monotonically) doubles as table-insertion order -- exactly what the
/// device registry's "FIFO order of insertion into the process table" wake
/// policy (spec.md §4.2) needs from `select_blocked`.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: BTreeMap<Pid, Pcb>,
    next_pid: u32,
    current: Option<Pid>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            processes: BTreeMap::new(),
            next_pid: sos_abi::FIRST_USER_PID,
            current: None,
        }
    }

    /// Allocates the next PID and reserves it; the caller is responsible for
    /// eventually inserting a `Pcb` with this PID.
    pub fn reserve_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn insert(&mut self, pcb: Pcb) {
        self.processes.insert(pcb.pid(), pcb);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        if self.current == Some(pid) {
            self.current = None;
        }
        self.processes.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.processes.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Iterates processes in PID (== table-insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.processes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.processes.values_mut()
    }

    /// Processes currently READY, in table order.
    pub fn ready(&self) -> impl Iterator<Item = &Pcb> {
        self.processes.values().filter(|p| p.is_ready())
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_pcb(&self) -> &Pcb {
        self.processes
            .get(&self.current.unwrap_lite())
            .unwrap_lite()
    }

    pub fn current_pcb_mut(&mut self) -> &mut Pcb {
        let pid = self.current.unwrap_lite();
        self.processes.get_mut(&pid).unwrap_lite()
    }

    pub fn set_current(&mut self, pid: Pid) {
        debug_assert!(self.processes.contains_key(&pid));
        self.current = Some(pid);
    }

    /// Finds the first (lowest-PID, i.e. earliest-inserted) process blocked
    /// on exactly `reason`. Used by `CLOSE` and by the I/O completion
    /// handlers.
    pub fn find_blocked(
        &self,
        pred: impl Fn(&BlockedFor) -> bool,
    ) -> Option<Pid> {
        self.processes
            .values()
            .find(|p| matches!(p.state(), PcbState::Blocked(b) if pred(&b)))
            .map(|p| p.pid())
    }

    /// Allocated regions of all live processes, sorted by BASE. Used by the
    /// allocator's compaction pass and by the disjointness invariant.
    pub fn regions_by_base(&self) -> Vec<(Pid, Word, Word)> {
        let mut v: Vec<_> = self
            .processes
            .values()
            .map(|p| (p.pid(), p.base(), p.lim()))
            .collect();
        v.sort_by_key(|&(_, base, _)| base);
        v
    }
}
