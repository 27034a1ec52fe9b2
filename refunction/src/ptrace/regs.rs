use std::fmt;

use refunction_common::{
    anyhow::{Context, Result},
    libc,
    nix::{sys::ptrace, unistd::Pid},
    syscalls::Sysno,
};

const ERESTARTSYS: i64 = 512;
const ERESTARTNOINTR: i64 = 513;
const ERESTARTNOHAND: i64 = 514;
const ERESTART_RESTARTBLOCK: i64 = 516;

/// Length of the x86_64 `syscall` instruction.
pub const SYSCALL_INSN_LEN: u64 = 2;
/// `0F 05` read as a little-endian word.
pub const SYSCALL_INSN: u16 = 0x050f;

/// General purpose register file of one thread.
#[derive(Clone, Copy)]
pub struct Registers(pub(crate) libc::user_regs_struct);

impl Registers {
    pub fn read(tid: Pid) -> Result<Self> {
        ptrace::getregs(tid)
            .map(Self)
            .with_context(|| format!("could not get registers of {tid}"))
    }

    pub fn write(&self, tid: Pid) -> Result<()> {
        ptrace::setregs(tid, self.0).with_context(|| format!("could not set registers of {tid}"))
    }

    pub fn pc(&self) -> u64 {
        self.0.rip
    }

    pub fn sp(&self) -> u64 {
        self.0.rsp
    }

    pub fn syscall_nr(&self) -> i64 {
        self.0.orig_rax as i64
    }

    pub fn return_value(&self) -> i64 {
        self.0.rax as i64
    }

    /// Whether the thread was stopped on the way out of an interrupted syscall
    /// that the kernel would otherwise restart.
    pub fn in_restartable_syscall(&self) -> bool {
        self.syscall_nr() >= 0
            && matches!(
                -self.return_value(),
                ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
            )
    }

    /// The same registers with any pending syscall restart applied by hand.
    ///
    /// The PC is moved back onto the `syscall` instruction and `orig_rax` is
    /// cleared, so resuming re-issues the call no matter what ran in between.
    pub fn resumable(&self) -> Self {
        let mut regs = self.0;
        if self.in_restartable_syscall() {
            regs.rax = if -self.return_value() == ERESTART_RESTARTBLOCK {
                Sysno::restart_syscall as u64
            } else {
                regs.orig_rax
            };
            regs.rip -= SYSCALL_INSN_LEN;
            regs.orig_rax = u64::MAX;
        }
        Self(regs)
    }

    /// Registers for executing `call` with the instruction at the current PC.
    pub(crate) fn with_syscall(&self, call: &SyscallArgs) -> Self {
        let mut regs = self.0;
        regs.rax = call.nr as u64;
        regs.orig_rax = u64::MAX;
        regs.rdi = call.args[0];
        regs.rsi = call.args[1];
        regs.rdx = call.args[2];
        regs.r10 = call.args[3];
        regs.r8 = call.args[4];
        regs.r9 = call.args[5];
        Self(regs)
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .field("rsp", &format_args!("{:#x}", self.0.rsp))
            .field("rax", &(self.0.rax as i64))
            .field("orig_rax", &(self.0.orig_rax as i64))
            .finish()
    }
}

/// A syscall to be injected into a stopped thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub nr: Sysno,
    pub args: [u64; 6],
}

impl SyscallArgs {
    pub fn new(nr: Sysno, args: &[u64]) -> Self {
        let mut all = [0u64; 6];
        for (slot, arg) in all.iter_mut().zip(args) {
            *slot = *arg;
        }
        Self { nr, args: all }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;

    fn regs(rip: u64, rax: i64, orig_rax: i64) -> Registers {
        let mut regs: libc::user_regs_struct = unsafe { MaybeUninit::zeroed().assume_init() };
        regs.rip = rip;
        regs.rax = rax as u64;
        regs.orig_rax = orig_rax as u64;
        Registers(regs)
    }

    #[test]
    fn test_resumable_rewinds_interrupted_read() {
        let read = Sysno::read as i64;
        let resumed = regs(0x1002, -ERESTARTSYS, read).resumable();

        assert_eq!(resumed.pc(), 0x1000);
        assert_eq!(resumed.return_value(), read);
        assert_eq!(resumed.syscall_nr(), -1);
    }

    #[test]
    fn test_resumable_uses_restart_syscall_for_restart_block() {
        let resumed = regs(0x2002, -ERESTART_RESTARTBLOCK, Sysno::nanosleep as i64).resumable();

        assert_eq!(resumed.pc(), 0x2000);
        assert_eq!(resumed.return_value(), Sysno::restart_syscall as i64);
    }

    #[test]
    fn test_resumable_keeps_completed_syscalls() {
        // EINTR is final, the kernel never restarts it
        let interrupted = regs(0x3002, -(libc::EINTR as i64), Sysno::read as i64);
        assert_eq!(interrupted.resumable().pc(), 0x3002);

        let user_code = regs(0x4000, -ERESTARTSYS, -1);
        assert_eq!(user_code.resumable().pc(), 0x4000);
        assert_eq!(user_code.resumable().return_value(), -ERESTARTSYS);
    }

    #[test]
    fn test_with_syscall_sets_abi_registers() {
        let call = SyscallArgs::new(Sysno::munmap, &[0x7f00_0000_0000, 4096]);
        let regs = regs(0x5000, 0, Sysno::read as i64).with_syscall(&call);

        assert_eq!(regs.0.rax, Sysno::munmap as u64);
        assert_eq!(regs.0.rdi, 0x7f00_0000_0000);
        assert_eq!(regs.0.rsi, 4096);
        assert_eq!(regs.0.rdx, 0);
        assert_eq!(regs.syscall_nr(), -1);
        assert_eq!(regs.pc(), 0x5000);
    }
}
