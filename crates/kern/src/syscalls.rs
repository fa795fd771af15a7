// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall and interrupt dispatch.
//!
//! This is the entry point from the CPU: the trap-handler capability set
//! enumerated in spec.md §6 is implemented as the inherent methods on
//! [`crate::sos::Sos`], each of which is a thin wrapper over a function in
//! this module. Every memory-touching operation here reads/writes through
//! `Ram` and never assumes a particular representation for it.
//!
//! # Syscall implementations
//!
//! With the exception of `EXIT` and `COREDUMP` (which never return to the
//! caller), syscalls are implemented by functions of roughly the shape:
//!
//! ```ignore
//! fn name(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> NextTask
//! ```
//!
//! `regs` is the live register file as the CPU sees it; syscalls decode
//! their arguments by popping `regs.sp`-indexed RAM cells, mutate kernel
//! state, and push a result back onto the same stack unless they defer to
//! a completion interrupt (`READ`/`WRITE`) or never return to this process
//! at all (`EXIT`, `EXEC`, `COREDUMP`).

use sos_abi::{
    status, BlockOp, BlockedFor, DeviceId, FaultInfo, Pid, Registers, SyscallId, Word,
    INSTRSIZE, SAVE_LOAD_TIME,
};

use crate::cpu::Ram;
use crate::err::UserError;
use crate::klog::klog;
use crate::sched::{self, NextTask, ScheduleOutcome};
use crate::sos::Sos;

/// What the CPU should do after a trap-handler callback returns.
#[derive(Debug)]
pub enum CallOutcome {
    /// Keep running the same process; `regs` was mutated in place and
    /// needs no further action from the CPU.
    Continue,
    /// Load `Registers` for a different process and run it instead.
    Switch(Registers),
    /// The simulation is over; this is its exit code.
    Halt(Word),
}

fn pop(ram: &dyn Ram, regs: &mut Registers) -> Word {
    let v = ram.read(regs.sp as usize);
    regs.sp -= 1;
    v
}

fn push(ram: &mut dyn Ram, regs: &mut Registers, value: Word) {
    regs.sp += 1;
    ram.write(regs.sp as usize, value);
}

/// Entry point for the `system_call()` trap callback. `regs` is the live
/// register file of the currently-running process; `caller` is its PID.
pub(crate) fn system_call(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> CallOutcome {
    let id = pop(sos.ram.as_ref(), regs);
    let next = match SyscallId::try_from(id) {
        Ok(SyscallId::Exit) => return exit(sos, caller),
        Ok(SyscallId::Output) => {
            let value = pop(sos.ram.as_ref(), regs);
            sos.console.emit(value);
            NextTask::Same
        }
        Ok(SyscallId::GetPid) => {
            push(sos.ram.as_mut(), regs, caller.0 as Word);
            NextTask::Same
        }
        Ok(SyscallId::Open) => open(sos, regs, caller),
        Ok(SyscallId::Close) => close(sos, regs, caller),
        Ok(SyscallId::Read) => read(sos, regs, caller),
        Ok(SyscallId::Write) => write(sos, regs, caller),
        Ok(SyscallId::Exec) => return exec(sos, regs, caller),
        Ok(SyscallId::Yield) => {
            save_caller(sos, caller, regs);
            NextTask::Reschedule
        }
        Ok(SyscallId::CoreDump) => return coredump(sos, regs, caller),
        Err(bad) => {
            klog!("{caller}: bad syscall id {}", bad.0);
            return fault(
                sos,
                caller,
                FaultInfo::IllegalInstruction { opcode: bad.0 },
            );
        }
    };
    resolve(sos, caller, next)
}

/// Saves `caller`'s registers into its PCB, transitioning it RUNNING ->
/// READY. Used by every path that keeps the caller alive but stops running
/// it (YIELD, busy-retry, preemption).
fn save_caller(sos: &mut Sos, caller: Pid, regs: &Registers) {
    let now = sos.clock.now();
    sos.processes
        .get_mut(caller)
        .expect("caller vanished before save")
        .save(*regs, now);
}

/// Turns a `NextTask` hint into the outcome the CPU acts on: if we're
/// keeping the same process running, nothing more to do; otherwise consult
/// the scheduler (or, for `EXEC`, switch straight to the process it named).
fn resolve(sos: &mut Sos, caller: Pid, next: NextTask) -> CallOutcome {
    match next {
        NextTask::Same => CallOutcome::Continue,
        NextTask::Specific(pid) => switch_to(sos, pid),
        NextTask::Reschedule => reschedule(sos, Some(caller)),
    }
}

fn switch_to(sos: &mut Sos, pid: Pid) -> CallOutcome {
    let now = sos.clock.now();
    sos.clock.advance(SAVE_LOAD_TIME);
    sos.processes.set_current(pid);
    let regs = sos
        .processes
        .get_mut(pid)
        .expect("scheduled a PCB that doesn't exist")
        .restore(now);
    CallOutcome::Switch(regs)
}

/// Consults the scheduler for what to run after `current` (if anything)
/// stops running, injecting the idle process or halting as needed.
pub(crate) fn reschedule(sos: &mut Sos, current: Option<Pid>) -> CallOutcome {
    loop {
        return match sched::pick_next(&sos.processes, current) {
            ScheduleOutcome::Run(pid) => switch_to(sos, pid),
            ScheduleOutcome::NeedIdle => {
                if !sos.ensure_idle() {
                    return CallOutcome::Halt(status::ERROR_NEED_MORE_SPACE);
                }
                continue;
            }
            ScheduleOutcome::Halt => CallOutcome::Halt(status::ERROR_NO_PROCESSES),
        };
    }
}

fn open(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> NextTask {
    let dev = DeviceId(pop(sos.ram.as_ref(), regs) as u32);
    match sos.devices.open(dev, caller) {
        Ok(true) => {
            push(sos.ram.as_mut(), regs, status::SUCCESS);
            NextTask::Same
        }
        Ok(false) => {
            // spec.md §4.2: SUCCESS is still the word pushed at block
            // time; the caller only sees it once it is unblocked and
            // resumes past the TRAP.
            push(sos.ram.as_mut(), regs, status::SUCCESS);
            let now = sos.clock.now();
            sos.processes
                .get_mut(caller)
                .expect("caller vanished")
                .block(*regs, crate::devices::blocked_on_open(dev), now);
            NextTask::Reschedule
        }
        Err(code) => {
            push(sos.ram.as_mut(), regs, code);
            NextTask::Same
        }
    }
}

fn close(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> NextTask {
    let dev = DeviceId(pop(sos.ram.as_ref(), regs) as u32);
    match sos.devices.close(dev, caller, &sos.processes) {
        Ok(waiter) => {
            if let Some(pid) = waiter {
                sos.processes
                    .get_mut(pid)
                    .expect("woken PCB vanished")
                    .unblock();
            }
            push(sos.ram.as_mut(), regs, status::SUCCESS);
            NextTask::Same
        }
        Err(code) => {
            push(sos.ram.as_mut(), regs, code);
            NextTask::Same
        }
    }
}

/// Re-pushes a syscall's opcode and arguments (in their original push
/// order) and rewinds `PC` by one instruction, so the next time this
/// process runs it re-executes the same `TRAP`. Used when a device isn't
/// available yet for `READ`/`WRITE`.
fn busy_retry(sos: &mut Sos, regs: &mut Registers, caller: Pid, args: &[Word], syscall: SyscallId) {
    for &arg in args {
        push(sos.ram.as_mut(), regs, arg);
    }
    push(sos.ram.as_mut(), regs, syscall as Word);
    regs.pc -= INSTRSIZE as Word;
    save_caller(sos, caller, regs);
}

fn read(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> NextTask {
    let addr = pop(sos.ram.as_ref(), regs);
    let dev = DeviceId(pop(sos.ram.as_ref(), regs) as u32);

    if let Err(code) = sos.devices.check_read(dev, caller) {
        push(sos.ram.as_mut(), regs, code);
        return NextTask::Same;
    }

    if sos.devices.is_available(dev) != Some(true) {
        busy_retry(sos, regs, caller, &[dev.0 as Word, addr], SyscallId::Read);
        return NextTask::Reschedule;
    }

    let now = sos.clock.now();
    let reason = BlockedFor {
        device: dev,
        op: BlockOp::Read,
        addr,
    };
    sos.processes
        .get_mut(caller)
        .expect("caller vanished")
        .block(*regs, reason, now);
    NextTask::Reschedule
}

fn write(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> NextTask {
    let data = pop(sos.ram.as_ref(), regs);
    let addr = pop(sos.ram.as_ref(), regs);
    let dev = DeviceId(pop(sos.ram.as_ref(), regs) as u32);

    if let Err(code) = sos.devices.check_write(dev, caller) {
        push(sos.ram.as_mut(), regs, code);
        return NextTask::Same;
    }

    if sos.devices.is_available(dev) != Some(true) {
        busy_retry(
            sos,
            regs,
            caller,
            &[dev.0 as Word, addr, data],
            SyscallId::Write,
        );
        return NextTask::Reschedule;
    }

    let now = sos.clock.now();
    let reason = BlockedFor {
        device: dev,
        op: BlockOp::Write,
        addr,
    };
    sos.processes
        .get_mut(caller)
        .expect("caller vanished")
        .block(*regs, reason, now);
    NextTask::Reschedule
}

fn exec(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> CallOutcome {
    let base_before = regs.base;

    let result = sos.loader.exec(
        &mut sos.processes,
        &mut sos.free,
        sos.ram.as_mut(),
        &mut sos.rng,
    );

    // `loader.exec` may have compacted memory to find room for the new
    // program, relocating the caller's own PCB (BASE/PC/SP all shifted by
    // the same delta). Compaction has no way to reach the live `regs` the
    // CPU holds, so re-sync them here before using or saving `regs` any
    // further -- otherwise the caller ends up running out of memory it no
    // longer owns (spec.md §4.1: compaction "rewrites BASE/LIM/PC/SP within
    // that PCB and the live CPU registers if that PCB is currently
    // running").
    let base_after = sos
        .processes
        .get(caller)
        .expect("caller vanished")
        .base();
    if base_after != base_before {
        let delta = base_after - base_before;
        regs.base += delta;
        regs.pc += delta;
        regs.sp += delta;
    }

    let new_pcb = match result {
        Ok(pcb) => pcb,
        Err(code) => {
            push(sos.ram.as_mut(), regs, code);
            return CallOutcome::Continue;
        }
    };

    // Rewind the caller so it re-executes this TRAP the next time it runs.
    regs.pc -= INSTRSIZE as Word;
    save_caller(sos, caller, regs);

    let new_pid = new_pcb.pid();
    sos.processes.insert(new_pcb);
    switch_to(sos, new_pid)
}

fn coredump(sos: &mut Sos, regs: &mut Registers, caller: Pid) -> CallOutcome {
    klog!(
        "coredump {caller}: r={:?} pc={} sp={} base={} lim={}",
        regs.r,
        regs.pc,
        regs.sp,
        regs.base,
        regs.lim
    );
    for _ in 0..3 {
        let v = pop(sos.ram.as_ref(), regs);
        sos.console.emit(v);
    }
    exit(sos, caller)
}

fn exit(sos: &mut Sos, caller: Pid) -> CallOutcome {
    if let Some(pcb) = sos.processes.remove(caller) {
        sos.free.free(pcb.base() as usize, pcb.lim() as usize);
    }
    sos.devices.forget_process(caller);
    klog!("{caller}: exited");
    reschedule(sos, None)
}

/// Shared tail for the three fatal interrupt handlers (illegal memory
/// access, divide-by-zero, illegal instruction): per spec.md §4.5 they are
/// all equivalent to an implicit `EXIT` of the offending process.
fn fault(sos: &mut Sos, offender: Pid, info: FaultInfo) -> CallOutcome {
    let err = UserError::from(info);
    klog!("{offender}: {err}");
    exit(sos, offender)
}

pub(crate) fn illegal_memory_access(sos: &mut Sos, offender: Pid, addr: Word) -> CallOutcome {
    fault(sos, offender, FaultInfo::IllegalMemoryAccess { address: addr })
}

pub(crate) fn divide_by_zero(sos: &mut Sos, offender: Pid) -> CallOutcome {
    fault(sos, offender, FaultInfo::DivideByZero)
}

pub(crate) fn illegal_instruction(sos: &mut Sos, offender: Pid, opcode: Word) -> CallOutcome {
    fault(sos, offender, FaultInfo::IllegalInstruction { opcode })
}

/// `clock()`: arrives on every `CLOCK_FREQ`-divisible tick. Saves whatever
/// was running and asks the scheduler to pick (which may re-select the
/// same process).
pub(crate) fn clock(sos: &mut Sos, regs: &Registers) -> CallOutcome {
    let current = sos.processes.current();
    if let Some(pid) = current {
        save_caller(sos, pid, regs);
    }
    reschedule(sos, current)
}

/// `io_read_complete(devId, addr, data)`: writes `data` then `SUCCESS` into
/// the blocked reader's saved stack (data first, so SUCCESS ends up on
/// top) and unblocks it.
pub(crate) fn io_read_complete(sos: &mut Sos, dev: DeviceId, addr: Word, data: Word) -> CallOutcome {
    complete(sos, dev, BlockOp::Read, addr, &[data, status::SUCCESS])
}

/// `io_write_complete(devId, addr)`: writes `SUCCESS` into the blocked
/// writer's saved stack and unblocks it.
pub(crate) fn io_write_complete(sos: &mut Sos, dev: DeviceId, addr: Word) -> CallOutcome {
    complete(sos, dev, BlockOp::Write, addr, &[status::SUCCESS])
}

fn complete(
    sos: &mut Sos,
    dev: DeviceId,
    op: BlockOp,
    addr: Word,
    words: &[Word],
) -> CallOutcome {
    let waiter = sos
        .processes
        .find_blocked(|b| b.device == dev && b.op == op && b.addr == addr);

    let Some(pid) = waiter else {
        // Defensive: no such waiter. If the current process is still
        // around, hand it the existence error; otherwise there is nothing
        // sensible to do but log it.
        klog!("completion for {dev} with no matching waiter");
        if let Some(current) = sos.processes.current() {
            let mut regs = *sos
                .processes
                .get(current)
                .expect("current always names a live PCB")
                .registers();
            push(sos.ram.as_mut(), &mut regs, status::ERROR_DEVICE_EXISTENCE);
            *sos.processes.get_mut(current).expect("checked above").registers_mut() = regs;
        }
        return CallOutcome::Continue;
    };

    let pcb = sos.processes.get_mut(pid).expect("waiter vanished");
    let mut regs = *pcb.registers();
    for &w in words {
        push(sos.ram.as_mut(), &mut regs, w);
    }
    let pcb = sos.processes.get_mut(pid).expect("waiter vanished");
    *pcb.registers_mut() = regs;
    pcb.unblock();

    CallOutcome::Continue
}
