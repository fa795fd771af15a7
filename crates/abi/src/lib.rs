// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI types for the simulated-OS kernel.
//!
//! This crate defines the value types that cross the boundary between the
//! kernel (`sos-kern`) and everything outside of it: the simulated CPU, the
//! test harness, device drivers. Keeping them in their own crate means a test
//! harness can depend on `sos-abi` without pulling in the kernel's scheduling
//! and allocation logic.

#![forbid(unsafe_code)]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A machine word. Registers, memory cells and instruction operands are all
/// `Word`s.
pub type Word = i32;

/// Number of `Word`s occupied by a single instruction: one opcode plus three
/// operands.
pub const INSTRSIZE: usize = 4;

/// Ticks between clock interrupts.
pub const CLOCK_FREQ: u32 = 5;

/// Fixed cost, in ticks, charged to a context switch for saving the
/// outgoing process's registers and loading the incoming one's.
pub const SAVE_LOAD_TIME: u32 = 30;

/// Process ID of the built-in idle process.
pub const IDLE_PID: Pid = Pid(999);

/// The first PID handed out by the loader; PIDs below this are reserved
/// (currently just `IDLE_PID`).
pub const FIRST_USER_PID: u32 = 1001;

/// A process identifier.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// A device identifier, as used by `OPEN`/`CLOSE`/`READ`/`WRITE` and by the
/// device registry.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// A contiguous range of RAM, used both by the free list (where it denotes
/// unallocated space) and the allocator's bookkeeping.
///
/// Invariant: `addr + size <= RAM size` for any `MemBlock` the allocator
/// hands out or keeps on its free list; a zero-size block is valid (it
/// denotes a fully-consumed residual) but is never actually stored.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemBlock {
    pub addr: usize,
    pub size: usize,
}

impl MemBlock {
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `self` and `other` touch or overlap, and so should coalesce
    /// into one block when both are free.
    pub fn adjacent_or_overlapping(&self, other: &MemBlock) -> bool {
        self.addr <= other.end() && other.addr <= self.end()
    }
}

/// The CPU's general-purpose and special registers.
///
/// `pc` and `sp` are absolute addresses into the shared simulated-RAM array,
/// not offsets from `base` -- this is what lets compaction relocate a
/// process by shifting `base`, `pc` and `sp` by the same delta and nothing
/// else. `lim` is a size (the process's window is `[base, base + lim)`), so
/// it is unaffected by relocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub r: [Word; 5],
    pub pc: Word,
    pub sp: Word,
    pub base: Word,
    pub lim: Word,
}

/// Opcodes understood by the simulated CPU's fetch/decode/execute loop.
///
/// This crate only needs enough of the instruction set to drive the
/// kernel's own decisions (`TRAP` dispatch, BASE-relative branch targets);
/// the rest of the execute loop is the CPU simulator's concern and out of
/// scope here.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Set = 0,
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
    Copy = 5,
    Branch = 6,
    Bne = 7,
    Blt = 8,
    Pop = 9,
    Push = 10,
    Load = 11,
    Save = 12,
    Trap = 15,
}

impl TryFrom<Word> for Opcode {
    type Error = BadOpcode;

    fn try_from(value: Word) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::Set,
            1 => Opcode::Add,
            2 => Opcode::Sub,
            3 => Opcode::Mul,
            4 => Opcode::Div,
            5 => Opcode::Copy,
            6 => Opcode::Branch,
            7 => Opcode::Bne,
            8 => Opcode::Blt,
            9 => Opcode::Pop,
            10 => Opcode::Push,
            11 => Opcode::Load,
            12 => Opcode::Save,
            15 => Opcode::Trap,
            other => return Err(BadOpcode(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unrecognized opcode {0}")]
pub struct BadOpcode(pub Word);

/// The ten syscalls a process may request, decoded from the opcode popped
/// off its stack on `TRAP`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyscallId {
    Exit = 0,
    Output = 1,
    GetPid = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Exec = 7,
    Yield = 8,
    CoreDump = 9,
}

impl TryFrom<Word> for SyscallId {
    type Error = BadSyscall;

    fn try_from(value: Word) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => SyscallId::Exit,
            1 => SyscallId::Output,
            2 => SyscallId::GetPid,
            3 => SyscallId::Open,
            4 => SyscallId::Close,
            5 => SyscallId::Read,
            6 => SyscallId::Write,
            7 => SyscallId::Exec,
            8 => SyscallId::Yield,
            9 => SyscallId::CoreDump,
            other => return Err(BadSyscall(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unrecognized syscall id {0}")]
pub struct BadSyscall(pub Word);

/// Result codes pushed onto a process's stack after a syscall completes (or
/// fails) synchronously.
pub mod status {
    use super::Word;

    pub const SUCCESS: Word = 0;
    pub const ERROR_DEVICE_EXISTENCE: Word = -2;
    pub const ERROR_DEVICE_NOT_USABLE: Word = -3;
    pub const ERROR_DEVICE_OPEN: Word = -4;
    pub const ERROR_DEVICE_NOT_OPEN: Word = -5;
    pub const ERROR_DEVICE_NOT_READABLE: Word = -6;
    pub const ERROR_DEVICE_NOT_WRITEABLE: Word = -7;
    pub const ERROR_NO_PROCESSES: Word = -8;
    pub const ERROR_NEED_MORE_SPACE: Word = -9;
}

bitflags! {
    /// The fixed capabilities of a device, as declared at registration.
    /// `SHAREABLE` controls whether `OPEN` admits more than one holder at a
    /// time; `READABLE`/`WRITEABLE` gate `READ`/`WRITE` (spec.md §4.2).
    ///
    /// `Serialize`/`Deserialize` come from the `bitflags` crate's `serde`
    /// feature rather than `#[derive(...)]`, since the generated struct's
    /// bit field is private.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct DeviceCaps: u8 {
        const SHAREABLE = 0b001;
        const READABLE  = 0b010;
        const WRITEABLE = 0b100;
    }
}

/// The operation a `BLOCKED` process is waiting to complete.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlockOp {
    /// Waiting for a non-shareable device to be closed by its holder.
    Open,
    /// Waiting for an outstanding read to complete.
    Read,
    /// Waiting for an outstanding write to complete.
    Write,
}

/// What a `BLOCKED` process is waiting on: a device, the operation it
/// requested, and the RAM address (meaningful for `Read`/`Write`) involved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockedFor {
    pub device: DeviceId,
    pub op: BlockOp,
    pub addr: Word,
}

/// Describes why a process was removed involuntarily: a CPU-raised fault
/// that, per the design, always results in an implicit `EXIT`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum FaultInfo {
    #[error("illegal memory access at address {address}")]
    IllegalMemoryAccess { address: Word },
    #[error("division by zero")]
    DivideByZero,
    #[error("illegal instruction (opcode {opcode})")]
    IllegalInstruction { opcode: Word },
}
