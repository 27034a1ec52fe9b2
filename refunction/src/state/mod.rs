//! Snapshots of a stopped process and the operations that rewind it.

use std::time::Instant;

use refunction_common::{
    anyhow::{anyhow, bail, Context, Result},
    nix::unistd::Pid,
    syscalls::Sysno,
    tracing::{debug, warn},
};

use crate::ptrace::{self, Registers, SyscallArgs, TraceTask, SYSCALL_INSN};

mod fd;
mod memory;
mod rlimit;

pub use fd::FileDescriptor;
pub use memory::{MemoryRegion, Permissions, HEAP, STACK};
pub use rlimit::{Limit, ResourceLimits};

pub(crate) use memory::clear_soft_dirty;

/// Registers, memory layout, descriptors and limits of a traced process.
///
/// Every thread must be in ptrace-stop while a state is captured. Once
/// captured it is never modified; restore operations write into the live
/// process only.
#[derive(Debug)]
pub struct ProcessState {
    pid: Pid,
    registers: Vec<(Pid, Registers)>,
    regions: Vec<MemoryRegion>,
    fds: Vec<FileDescriptor>,
    rlimits: ResourceLimits,
}

impl ProcessState {
    pub fn capture(pid: Pid, tasks: &[TraceTask]) -> Result<Self> {
        let registers = tasks
            .iter()
            .map(|task| Ok((task.tid(), task.registers()?)))
            .collect::<Result<Vec<_>>>()
            .context("could not capture registers")?;

        Ok(Self {
            pid,
            registers,
            regions: memory::read_regions(pid)?,
            fds: fd::read_file_descriptors(pid)?,
            rlimits: rlimit::read_rlimits(pid)?,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn registers(&self, tid: Pid) -> Option<&Registers> {
        self.registers
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, regs)| regs)
    }

    /// Program counter of the thread group leader.
    pub fn pc(&self) -> Result<u64> {
        self.registers(self.pid)
            .map(Registers::pc)
            .ok_or_else(|| anyhow!("no registers captured for leader {}", self.pid))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn file_descriptors(&self) -> &[FileDescriptor] {
        &self.fds
    }

    pub fn rlimits(&self) -> &ResourceLimits {
        &self.rlimits
    }

    /// Total number of captured bytes.
    pub fn memory_size(&self) -> usize {
        self.regions
            .iter()
            .filter_map(|r| r.content.as_ref())
            .map(Vec::len)
            .sum()
    }

    pub fn save_writable_pages(&mut self) -> Result<()> {
        let start = Instant::now();
        memory::save_writable_pages(self.pid, &mut self.regions)?;
        debug!(
            "saved {} bytes of {} in {:?}",
            self.memory_size(),
            self.pid,
            start.elapsed()
        );
        Ok(())
    }

    /// Soft-dirty pages of the named region in the live process.
    pub fn count_dirty_pages(&self, name: &str) -> Result<usize> {
        let region = self
            .region(name)
            .ok_or_else(|| anyhow!("no memory region {name} found"))?;
        memory::count_dirty_pages(self.pid, region)
    }

    pub fn restore_dirty_pages(&self) -> Result<usize> {
        memory::restore_dirty_pages(self.pid, &self.regions)
    }

    /// Seats the captured registers of every task, in resumable form.
    pub fn restore_registers(&self, tasks: &[TraceTask]) -> Result<()> {
        for task in tasks {
            let regs = self
                .registers(task.tid())
                .ok_or_else(|| anyhow!("no registers captured for {}", task.tid()))?;
            task.set_registers(regs.resumable())?;
        }
        Ok(())
    }

    pub fn program_break_changed(&self) -> Result<bool> {
        let current = memory::read_regions(self.pid)?;
        let heap_end = |regions: &[MemoryRegion]| {
            regions.iter().find(|r| r.name == HEAP).map(|r| r.end)
        };
        Ok(heap_end(&self.regions) != heap_end(&current))
    }

    pub fn num_memory_locations_changed(&self) -> Result<bool> {
        Ok(memory::read_regions(self.pid)?.len() != self.regions.len())
    }

    /// Positional comparison of the region list, ignoring contents.
    pub fn memory_changed(&self) -> Result<bool> {
        let current = memory::read_regions(self.pid)?;
        Ok(current.len() != self.regions.len()
            || current
                .iter()
                .zip(&self.regions)
                .any(|(now, then)| !now.same_location(then)))
    }

    pub fn fds_changed(&self) -> Result<bool> {
        Ok(fd::read_file_descriptors(self.pid)?.len() != self.fds.len())
    }

    /// Moves the program break back to where it was at capture time.
    pub fn restore_program_break(&self, leader: &TraceTask) -> Result<()> {
        let target = match self.region(HEAP) {
            Some(heap) => heap.end,
            None => match memory::read_regions(self.pid)?
                .into_iter()
                .find(|r| r.name == HEAP)
            {
                Some(heap) => heap.start,
                None => return Ok(()),
            },
        };

        let exit = leader.run_syscall(SyscallArgs::new(Sysno::brk, &[target]))?;
        if exit.return_value() as u64 != target {
            bail!(
                "could not restore the program break: wanted {target:#x}, got {:#x}",
                exit.return_value()
            );
        }
        debug!("restored program break of {} to {target:#x}", self.pid);
        Ok(())
    }

    /// Unmaps memory that was mapped after capture.
    ///
    /// `[stack]` growth is kept and `[heap]` is left to the program break restore.
    pub fn unmap_new_locations(&self, leader: &TraceTask) -> Result<()> {
        let taken: Vec<_> = self.regions.iter().map(MemoryRegion::range).collect();
        let current = memory::read_regions(self.pid)?;

        for region in current.iter().filter(|r| r.name != STACK && r.name != HEAP) {
            for range in memory::subtract_ranges(region.range(), &taken) {
                let len = range.end - range.start;
                let exit = leader.run_syscall(SyscallArgs::new(Sysno::munmap, &[range.start, len]))?;
                if exit.return_value() != 0 {
                    bail!(
                        "could not unmap {:#x}-{:#x} ({}): {}",
                        range.start,
                        range.end,
                        region.name,
                        exit.return_value()
                    );
                }
                debug!("unmapped {:#x}-{:#x} {}", range.start, range.end, region.name);
            }
        }

        for gone in self
            .regions
            .iter()
            .filter(|then| !current.iter().any(|now| now.start <= then.start && then.end <= now.end))
        {
            warn!("{gone:?} was unmapped after capture and cannot be restored");
        }

        Ok(())
    }

    /// Re-seats the leader on its captured registers after injected syscalls.
    ///
    /// An interrupted restartable syscall is re-issued from the rewound PC, so
    /// the instruction there has to be `syscall`.
    pub fn fixup_syscall_state(&self, leader: &TraceTask) -> Result<()> {
        let saved = self
            .registers(leader.tid())
            .ok_or_else(|| anyhow!("no registers captured for {}", leader.tid()))?;
        let resumable = saved.resumable();

        if resumable.pc() != saved.pc() {
            let pc = resumable.pc();
            let word = leader.in_stop(move |tid| ptrace::peek(tid, pc))??;
            if word as u16 != SYSCALL_INSN {
                bail!("no syscall instruction at {pc:#x} to resume from");
            }
        }

        leader.set_registers(resumable)?;
        debug!(
            "fixed up syscall state of {}: {:?} -> {:?}",
            leader.tid(),
            saved,
            resumable
        );
        Ok(())
    }
}
