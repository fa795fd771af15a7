// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starvation-aware process scheduler.

use sos_abi::Pid;

use crate::task::ProcessTable;

/// Scheduling hint returned alongside a syscall's result, telling the
/// dispatcher whether it needs to invoke the scheduler before returning to
/// user code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NextTask {
    /// Keep running whatever was running.
    Same,
    /// Switch straight to this process without consulting `pick_next`.
    /// Used by `EXEC`, which decides who runs next itself.
    Specific(Pid),
    /// A new process must be selected; call `pick_next`.
    Reschedule,
}

/// Result of a scheduling decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScheduleOutcome {
    /// Run this process next.
    Run(Pid),
    /// No READY process exists, but at least one is BLOCKED; the caller
    /// should inject the idle process (see `sos::Sos::ensure_idle`).
    NeedIdle,
    /// The process table is empty; the simulation halts.
    Halt,
}

fn average(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let count = values.clone().count();
    if count == 0 {
        0.0
    } else {
        values.sum::<f64>() / count as f64
    }
}

/// Selects the next process to run, per the preference order in spec.md
/// §4.4:
///
/// 1. The currently running process carries a synthetic +100 starvation
///    bias (the cost of a context switch), so it keeps running unless a
///    READY candidate's own starvation clearly outweighs that bias.
/// 2. Among READY candidates, prefer one whose `avg_starve` or
///    `last_ready_time` is at or above the fleet average.
/// 3. Break remaining ties by preferring `avg_run_time` at or above the
///    fleet average.
///
/// spec.md flags the source's exact tie-breaking as "convoluted" and
/// explicitly permits simplifying it; this reproduces the preference order
/// as a weighted score rather than the original's nested conditionals.
pub fn pick_next(processes: &ProcessTable, current: Option<Pid>) -> ScheduleOutcome {
    if processes.is_empty() {
        return ScheduleOutcome::Halt;
    }

    let fleet_avg_starve = average(processes.iter().map(|p| p.timing().avg_starve));
    let fleet_avg_ready =
        average(processes.iter().map(|p| p.timing().last_ready_time as f64));
    let fleet_avg_run = average(processes.iter().map(|p| p.timing().avg_run_time));

    let mut best: Option<(Pid, f64)> = None;
    for p in processes.ready() {
        let timing = p.timing();
        let mut score = timing.avg_starve;
        if Some(p.pid()) == current {
            score += 100.0;
        }
        if timing.avg_starve >= fleet_avg_starve
            || timing.last_ready_time as f64 >= fleet_avg_ready
        {
            score += 10.0;
        }
        if timing.avg_run_time >= fleet_avg_run {
            score += 1.0;
        }
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((p.pid(), score));
        }
    }

    match best {
        Some((pid, _)) => ScheduleOutcome::Run(pid),
        None if processes.iter().any(|p| p.state().is_blocked()) => {
            ScheduleOutcome::NeedIdle
        }
        None => ScheduleOutcome::Halt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_abi::Registers;

    fn pcb_at(table: &mut ProcessTable, base: i32) -> Pid {
        let pid = table.reserve_pid();
        let mut regs = Registers::default();
        regs.base = base;
        regs.lim = 10;
        table.insert(crate::task::Pcb::new(pid, regs));
        pid
    }

    #[test]
    fn empty_table_halts() {
        let table = ProcessTable::new();
        assert_eq!(pick_next(&table, None), ScheduleOutcome::Halt);
    }

    #[test]
    fn single_ready_process_wins() {
        let mut table = ProcessTable::new();
        let pid = pcb_at(&mut table, 0);
        assert_eq!(pick_next(&table, None), ScheduleOutcome::Run(pid));
    }

    #[test]
    fn all_blocked_requests_idle() {
        let mut table = ProcessTable::new();
        let pid = pcb_at(&mut table, 0);
        let regs = *table.get(pid).unwrap().registers();
        table.get_mut(pid).unwrap().block(
            regs,
            sos_abi::BlockedFor {
                device: sos_abi::DeviceId(1),
                op: sos_abi::BlockOp::Open,
                addr: 0,
            },
            0,
        );
        assert_eq!(pick_next(&table, None), ScheduleOutcome::NeedIdle);
    }
}
