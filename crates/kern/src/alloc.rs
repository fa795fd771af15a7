// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-list allocator: best-fit allocation, free-and-coalesce, compaction.

use sos_abi::MemBlock;

use crate::cpu::Ram;
use crate::klog::klog;
use crate::task::ProcessTable;

/// Tracks unallocated RAM as a set of disjoint, non-adjacent `MemBlock`s.
#[derive(Debug)]
pub struct FreeList {
    ram_size: usize,
    free: Vec<MemBlock>,
}

impl FreeList {
    /// Creates a free list for a RAM of `ram_size` words, entirely free.
    pub fn new(ram_size: usize) -> Self {
        FreeList {
            ram_size,
            free: vec![MemBlock {
                addr: 0,
                size: ram_size,
            }],
        }
    }

    pub fn ram_size(&self) -> usize {
        self.ram_size
    }

    pub fn total_free(&self) -> usize {
        self.free.iter().map(|b| b.size).sum()
    }

    pub fn blocks(&self) -> &[MemBlock] {
        &self.free
    }

    /// Best-fit search: among blocks large enough to satisfy `size`, the
    /// smallest one wins; ties go to the lowest address. Returns the index
    /// into `self.free`.
    ///
    /// A block whose size exactly equals `size` is eligible and produces an
    /// empty (zero-size, discarded) residual -- this is the "residual may
    /// be empty" case spec.md §4.1 calls out explicitly.
    fn best_fit_index(&self, size: usize) -> Option<usize> {
        self.free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| (b.size, b.addr))
            .map(|(i, _)| i)
    }

    /// Allocates `size` words, compacting first if necessary. Returns the
    /// base address of the new allocation, or `None` if `size` exceeds the
    /// total free space even after compaction.
    pub fn alloc(
        &mut self,
        size: usize,
        processes: &mut ProcessTable,
        ram: &mut dyn Ram,
    ) -> Option<usize> {
        if size == 0 {
            return None;
        }
        if let Some(addr) = self.try_best_fit(size) {
            return Some(addr);
        }
        if self.total_free() < size {
            klog!(
                "alloc: need {} words, only {} free across {} blocks",
                size,
                self.total_free(),
                self.free.len()
            );
            return None;
        }
        self.compact(processes, ram);
        self.try_best_fit(size)
    }

    fn try_best_fit(&mut self, size: usize) -> Option<usize> {
        let idx = self.best_fit_index(size)?;
        let block = self.free.remove(idx);
        let addr = block.addr;
        // Residual is placed immediately after the allocation, with no gap
        // (spec.md §9 mandates this; a prior revision left a one-word gap
        // here by placing the residual at `addr + size + 1`).
        let residual = MemBlock {
            addr: addr + size,
            size: block.size - size,
        };
        if !residual.is_empty() {
            self.free.push(residual);
        }
        klog!("alloc: placed {} words at {}", size, addr);
        Some(addr)
    }

    /// Returns `[base, base+size)` to the free list, coalescing with any
    /// immediately-adjacent free neighbors.
    pub fn free(&mut self, base: usize, size: usize) {
        if size == 0 {
            return;
        }
        let mut block = MemBlock { addr: base, size };
        self.free.retain(|existing| {
            if block.adjacent_or_overlapping(existing) {
                let new_addr = block.addr.min(existing.addr);
                let new_end = block.end().max(existing.end());
                block = MemBlock {
                    addr: new_addr,
                    size: new_end - new_addr,
                };
                false
            } else {
                true
            }
        });
        klog!("free: returning {} words at {}", block.size, block.addr);
        self.free.push(block);
    }

    /// Slides every allocated region downward so that the live processes
    /// occupy `[0, total_allocated)` contiguously, in ascending BASE order,
    /// collapsing the free list to a single trailing block.
    fn compact(&mut self, processes: &mut ProcessTable, ram: &mut dyn Ram) {
        klog!("compact: {} words free, compacting", self.total_free());
        let mut next_base = 0usize;
        for (pid, base, lim) in processes.regions_by_base() {
            let base = base as usize;
            let lim = lim as usize;
            if base != next_base {
                ram.copy_within(base, next_base, lim);
                let pcb = processes.get_mut(pid).expect("pcb vanished mid-compaction");
                pcb.relocate(next_base as i32);
            }
            next_base += lim;
        }
        self.free = vec![MemBlock {
            addr: next_base,
            size: self.ram_size - next_base,
        }];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::tests::VecRam;
    use sos_abi::{Pid, Registers};

    #[test]
    fn alloc_then_free_restores_single_block() {
        let mut fl = FreeList::new(1000);
        let mut table = ProcessTable::new();
        let mut ram = VecRam::new(1000);

        let addr = fl.alloc(250, &mut table, &mut ram).unwrap();
        assert_eq!(addr, 0);
        fl.free(addr, 250);

        assert_eq!(fl.blocks(), &[MemBlock { addr: 0, size: 1000 }]);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_block() {
        let mut fl = FreeList::new(1000);
        fl.free = vec![
            MemBlock { addr: 0, size: 500 },
            MemBlock { addr: 500, size: 100 },
            MemBlock { addr: 600, size: 400 },
        ];
        let idx = fl.best_fit_index(80).unwrap();
        assert_eq!(fl.free[idx], MemBlock { addr: 500, size: 100 });
    }

    #[test]
    fn residual_has_no_gap() {
        let mut fl = FreeList::new(1000);
        let mut table = ProcessTable::new();
        let mut ram = VecRam::new(1000);

        let addr = fl.alloc(100, &mut table, &mut ram).unwrap();
        assert_eq!(addr, 0);
        // The residual must start exactly at addr+size=100, not 101.
        assert_eq!(fl.blocks(), &[MemBlock { addr: 100, size: 900 }]);
    }

    #[test]
    fn exact_fit_leaves_no_residual() {
        let mut fl = FreeList::new(1000);
        fl.free = vec![MemBlock { addr: 0, size: 100 }];
        let mut table = ProcessTable::new();
        let mut ram = VecRam::new(1000);

        let addr = fl.alloc(100, &mut table, &mut ram).unwrap();
        assert_eq!(addr, 0);
        assert!(fl.blocks().is_empty());
    }

    #[test]
    fn compaction_relocates_processes_and_preserves_contents() {
        let mut fl = FreeList::new(3000);
        let mut table = ProcessTable::new();
        let mut ram = VecRam::new(3000);

        // Three processes at non-contiguous bases with a gap between them.
        for (base, lim, value) in [(0usize, 500usize, 11), (700, 500, 22), (1400, 500, 33)]
        {
            let pid = table.reserve_pid();
            let mut regs = Registers::default();
            regs.base = base as i32;
            regs.lim = lim as i32;
            regs.pc = base as i32 + 4;
            regs.sp = base as i32 + 10;
            ram.write(base, value);
            table.insert(crate::task::Pcb::new(pid, regs));
        }
        fl.free = vec![
            MemBlock { addr: 500, size: 200 },
            MemBlock { addr: 1200, size: 200 },
            MemBlock { addr: 1900, size: 1100 },
        ];

        let addr = fl.alloc(800, &mut table, &mut ram).unwrap();
        assert_eq!(addr, 1500);

        let mut bases: Vec<i32> = table.iter().map(|p| p.base()).collect();
        bases.sort();
        assert_eq!(bases, vec![0, 500, 1000]);

        // Contents at each process's new BASE were preserved.
        for (expected_base, value) in [(0, 11), (500, 22), (1000, 33)] {
            assert_eq!(ram.read(expected_base), value);
        }
    }
}
