use std::ffi::c_void;

use refunction_common::{
    anyhow::{bail, Context, Result},
    libc,
    nix::{
        sys::{
            ptrace,
            signal::Signal,
            wait::{waitpid, WaitPidFlag, WaitStatus},
        },
        unistd::Pid,
    },
    tracing::trace,
};

use super::regs::{Registers, SyscallArgs, SYSCALL_INSN};

/// Executes `call` inside a stopped thread by planting a `syscall`
/// instruction at its PC and single-stepping over it.
///
/// The thread's registers and code are put back before returning, also when
/// the injection fails. Returns the registers as they were after the call.
///
/// Signals delivered while stepping are suppressed and collected in `held`.
pub(crate) fn run_syscall(tid: Pid, call: &SyscallArgs, held: &mut Vec<Signal>) -> Result<Registers> {
    let saved = Registers::read(tid)?;
    let pc = saved.pc();

    let word = peek(tid, pc)?;
    let patched = (word & !0xffff) | SYSCALL_INSN as libc::c_long;
    poke(tid, pc, patched)?;

    let exit = step_syscall(tid, &saved, call, held);
    let restored = poke(tid, pc, word).and_then(|_| saved.write(tid));

    let exit = exit.with_context(|| format!("could not inject {}", call.nr.name()))?;
    restored.context("could not restore thread after syscall injection")?;

    trace!(
        "injected {}{:x?} into {tid}: {}",
        call.nr.name(),
        call.args,
        exit.return_value()
    );
    Ok(exit)
}

fn step_syscall(
    tid: Pid,
    saved: &Registers,
    call: &SyscallArgs,
    held: &mut Vec<Signal>,
) -> Result<Registers> {
    saved.with_syscall(call).write(tid)?;

    loop {
        ptrace::step(tid, None).context("could not single step")?;
        match waitpid(tid, Some(WaitPidFlag::__WALL)).context("could not wait for single step")? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => return Registers::read(tid),
            // delivery stops come before the instruction runs, step again
            WaitStatus::Stopped(_, sig) => {
                trace!("holding {sig:?} of {tid} while stepping");
                held.push(sig);
            }
            status => bail!("unexpected status while stepping over syscall: {status:?}"),
        }
    }
}

pub(crate) fn peek(tid: Pid, addr: u64) -> Result<libc::c_long> {
    ptrace::read(tid, addr as ptrace::AddressType)
        .with_context(|| format!("could not read word at {addr:#x}"))
}

fn poke(tid: Pid, addr: u64, word: libc::c_long) -> Result<()> {
    // SAFETY: PTRACE_POKEDATA takes the word by value, `data` is never dereferenced
    unsafe { ptrace::write(tid, addr as ptrace::AddressType, word as *mut c_void) }
        .with_context(|| format!("could not write word at {addr:#x}"))
}
