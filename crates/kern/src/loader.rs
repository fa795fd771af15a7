// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program catalog and `EXEC` implementation.

use rand::Rng;

use sos_abi::{status, Pid, Registers, Word};

use crate::alloc::FreeList;
use crate::cpu::Ram;
use crate::klog::klog;
use crate::task::{Pcb, ProcessTable};

/// A loadable program image: a flat sequence of words written verbatim
/// into the process's RAM window starting at its BASE.
#[derive(Clone, Debug)]
pub struct Program {
    pub name: String,
    pub image: Vec<Word>,
}

/// Registers programs and picks one, semi-randomly, on every `EXEC`.
#[derive(Default)]
pub struct Loader {
    catalog: Vec<Program>,
}

impl Loader {
    pub fn new() -> Self {
        Loader::default()
    }

    pub fn register(&mut self, program: Program) {
        self.catalog.push(program);
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Implements `EXEC`: picks a program, allocates address space for it,
    /// writes its image into RAM, and initializes registers. The returned
    /// PCB is not yet inserted into the process table; the caller (the
    /// dispatcher) does that after deciding what happens to the process
    /// being preempted.
    pub fn exec(
        &self,
        table: &mut ProcessTable,
        free: &mut FreeList,
        ram: &mut dyn Ram,
        rng: &mut impl Rng,
    ) -> Result<Pcb, Word> {
        if self.catalog.is_empty() {
            return Err(status::ERROR_NO_PROCESSES);
        }
        let program = &self.catalog[rng.gen_range(0..self.catalog.len())];

        let size = program.image.len();
        let base = free
            .alloc(size, table, ram)
            .ok_or(status::ERROR_NEED_MORE_SPACE)?;

        for (offset, word) in program.image.iter().enumerate() {
            ram.write(base + offset, *word);
        }

        let pid = table.reserve_pid();
        let registers = Registers {
            r: [0; 5],
            pc: base as Word,
            sp: base as Word,
            base: base as Word,
            lim: size as Word,
        };
        klog!("exec: {pid} running {:?} at base {base}", program.name);
        Ok(Pcb::new(pid, registers))
    }

    /// Builds the synthetic idle program: `SET r0=0` twice, `PUSH r0`,
    /// `TRAP`, matching the four-instruction stub in spec.md §3. Pushing
    /// r0 (which holds the `EXIT` syscall id, 0) before the trap is what
    /// makes the trap resolve to `EXIT`.
    pub fn idle_image() -> Vec<Word> {
        use sos_abi::Opcode;
        vec![
            Opcode::Set as Word,
            0,
            0,
            0,
            Opcode::Set as Word,
            0,
            0,
            0,
            Opcode::Push as Word,
            0,
            0,
            0,
            Opcode::Trap as Word,
            0,
            0,
            0,
        ]
    }
}
