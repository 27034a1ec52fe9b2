//! Per-thread ptrace supervision.
//!
//! Linux only accepts ptrace requests for a thread from the task that attached
//! to it, so every [`TraceTask`] owns a dedicated OS thread and all work is
//! marshalled to it through a channel of orders.

use std::{
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
};

use refunction_common::{
    anyhow::{self, anyhow, bail, Context, Result},
    libc,
    nix::{
        errno::Errno,
        sys::{
            ptrace::{self, Options},
            signal::Signal,
            wait::{waitpid, WaitPidFlag, WaitStatus},
        },
        unistd::Pid,
    },
    tracing::{debug, error, trace, warn},
};

mod inject;
mod regs;
mod stop;
mod strace;

pub(crate) use inject::peek;
pub use regs::{Registers, SyscallArgs, SYSCALL_INSN, SYSCALL_INSN_LEN};
pub use stop::StopReason;
pub use strace::SafeWriter;

use stop::StopMailbox;

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Sink for syscall names, enables `PTRACE_O_TRACESYSGOOD` when set.
    pub strace: Option<SafeWriter>,
}

impl TraceOptions {
    pub fn with_strace(writer: SafeWriter) -> Self {
        Self {
            strace: Some(writer),
        }
    }

    fn ptrace_options(&self) -> Options {
        if self.strace.is_some() {
            Options::PTRACE_O_TRACESYSGOOD
        } else {
            Options::empty()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Attaching,
    Running,
    Stopped,
    Detached,
    Exited,
}

type InStopFn = Box<dyn FnOnce(Pid) + Send>;

enum Order {
    Continue(Option<Signal>, SyncSender<Result<()>>),
    RunSyscall(SyscallArgs, SyncSender<Result<Registers>>),
    Detach(SyncSender<Result<()>>),
    InStop(InStopFn),
}

struct Shared {
    mailbox: StopMailbox,
    state: Mutex<TaskState>,
    error: Mutex<Option<anyhow::Error>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TaskState) {
        *self.state() = state;
    }

    fn finish(&self, state: TaskState) {
        self.set_state(state);
        self.mailbox.close();
    }

    fn fail(&self, err: anyhow::Error) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.finish(TaskState::Exited);
    }
}

/// Handle to the tracer thread of a single traced thread.
pub struct TraceTask {
    pid: Pid,
    tid: Pid,
    orders: Mutex<Sender<Order>>,
    shared: Arc<Shared>,
}

impl TraceTask {
    /// Seizes `tid` of thread group `pid` from a freshly spawned tracer thread.
    ///
    /// The thread is left running.
    pub fn attach(pid: Pid, tid: Pid, options: &TraceOptions) -> Result<Self> {
        let (orders_tx, orders_rx) = mpsc::channel();
        let (attached_tx, attached_rx) = mpsc::sync_channel(1);
        let shared = Arc::new(Shared {
            mailbox: StopMailbox::default(),
            state: Mutex::new(TaskState::Attaching),
            error: Mutex::new(None),
        });

        thread::Builder::new()
            .name(format!("trace-{tid}"))
            .spawn({
                let shared = shared.clone();
                let options = options.clone();
                move || {
                    let seized = ptrace::seize(tid, options.ptrace_options())
                        .with_context(|| format!("could not seize {tid}"));
                    if seized.is_err() {
                        shared.finish(TaskState::Exited);
                        let _ = attached_tx.send(seized);
                        return;
                    }
                    shared.set_state(TaskState::Running);
                    let _ = attached_tx.send(seized);

                    let mut tracer = Tracer {
                        pid,
                        tid,
                        in_syscall: false,
                        options,
                        shared: shared.clone(),
                        orders: orders_rx,
                    };
                    if let Err(e) = tracer.run() {
                        error!("trace task {tid} failed: {e:#}");
                        shared.fail(e);
                    }
                }
            })
            .context("could not spawn trace thread")?;

        attached_rx
            .recv()
            .map_err(|_| anyhow!("trace thread for {tid} died while attaching"))??;
        debug!(%pid, %tid, "attached");

        Ok(Self {
            pid,
            tid,
            orders: Mutex::new(orders_tx),
            shared,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state()
    }

    /// The error that terminated the tracer thread, if any.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current stop token, if the thread is stopped.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.mailbox.peek()
    }

    /// Brings the thread into ptrace-stop.
    ///
    /// Returns immediately when it is already stopped. Concurrent callers share
    /// a single `SIGSTOP`.
    pub fn stop(&self) -> Result<()> {
        if self.shared.mailbox.request_stop(self.tid)? {
            trace!("sending SIGSTOP to {}", self.tid);
            if let Err(e) = tgkill(self.pid, self.tid, Signal::SIGSTOP) {
                self.shared.mailbox.cancel_request();
                return Err(e);
            }
        }
        self.wait_stop().map(drop)
    }

    /// Blocks until the thread is stopped for any reason.
    pub fn wait_stop(&self) -> Result<StopReason> {
        self.shared.mailbox.wait(self.tid)
    }

    /// Resumes a stopped thread, delivering `signal` if given.
    pub fn cont(&self, signal: Option<Signal>) -> Result<()> {
        self.ensure_stopped()?;
        self.order(|reply| Order::Continue(signal, reply))
    }

    pub fn run_syscall(&self, call: SyscallArgs) -> Result<Registers> {
        self.ensure_stopped()?;
        self.order(|reply| Order::RunSyscall(call, reply))
    }

    /// Runs `f` on the tracer thread while the thread is stopped.
    pub fn in_stop<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(Pid) -> R + Send + 'static,
    {
        self.ensure_stopped()?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(Order::InStop(Box::new(move |tid| {
            let _ = tx.send(f(tid));
        })))?;
        rx.recv().map_err(|_| self.exited())
    }

    pub fn registers(&self) -> Result<Registers> {
        self.in_stop(Registers::read)?
    }

    pub fn set_registers(&self, regs: Registers) -> Result<()> {
        self.in_stop(move |tid| regs.write(tid))?
    }

    /// Releases a stopped thread, suppressing the signal it was stopped with.
    pub fn detach(&self) -> Result<()> {
        self.ensure_stopped()?;
        self.order(Order::Detach)
    }

    fn ensure_stopped(&self) -> Result<()> {
        match self.state() {
            TaskState::Stopped => Ok(()),
            TaskState::Detached | TaskState::Exited => Err(self.exited()),
            state => bail!("trace task {} is not stopped ({state:?})", self.tid),
        }
    }

    fn order<R>(&self, make: impl FnOnce(SyncSender<Result<R>>) -> Order) -> Result<R> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(make(tx))?;
        rx.recv().map_err(|_| self.exited())?
    }

    fn send(&self, order: Order) -> Result<()> {
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(order)
            .map_err(|_| self.exited())
    }

    fn exited(&self) -> anyhow::Error {
        anyhow!("trace task {} has exited", self.tid)
    }
}

pub(crate) fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            pid.as_raw(),
            tid.as_raw(),
            signal as libc::c_int,
        )
    };
    Errno::result(res)
        .map(drop)
        .with_context(|| format!("could not send {signal:?} to {tid}"))
}

enum Flow {
    Running,
    Detached,
}

/// State owned by the tracer thread.
struct Tracer {
    pid: Pid,
    tid: Pid,
    /// Between a syscall-entry-stop and its syscall-exit-stop.
    in_syscall: bool,
    options: TraceOptions,
    shared: Arc<Shared>,
    orders: Receiver<Order>,
}

impl Tracer {
    fn run(&mut self) -> Result<()> {
        loop {
            let status = waitpid(self.tid, Some(WaitPidFlag::__WALL))
                .with_context(|| format!("could not wait for {}", self.tid))?;

            let reason = match status {
                WaitStatus::PtraceEvent(_, sig, libc::PTRACE_EVENT_STOP) => StopReason::Group(sig),
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.shared.mailbox.swallow_stray() => {
                    trace!("swallowing stray SIGSTOP of {}", self.tid);
                    self.in_syscall = false;
                    self.restart(None)?;
                    continue;
                }
                WaitStatus::Stopped(_, sig) => StopReason::Signal(sig),
                WaitStatus::PtraceSyscall(_) => {
                    self.trace_syscall()?;
                    continue;
                }
                WaitStatus::PtraceEvent(_, _, event) => {
                    trace!("ignoring ptrace event {event} of {}", self.tid);
                    self.restart(None)?;
                    continue;
                }
                WaitStatus::Exited(_, code) => {
                    debug!("{} exited with {code}", self.tid);
                    self.shared.finish(TaskState::Exited);
                    return Ok(());
                }
                WaitStatus::Signaled(_, sig, _) => {
                    debug!("{} killed by {sig:?}", self.tid);
                    self.shared.finish(TaskState::Exited);
                    return Ok(());
                }
                WaitStatus::Continued(_) | WaitStatus::StillAlive => continue,
            };

            trace!("{} stopped: {reason:?}", self.tid);
            // signal stops are only reported outside of syscalls
            self.in_syscall = false;
            self.shared.set_state(TaskState::Stopped);
            self.shared.mailbox.publish(reason);

            if let Flow::Detached = self.await_orders()? {
                return Ok(());
            }
        }
    }

    fn await_orders(&mut self) -> Result<Flow> {
        loop {
            let Ok(order) = self.orders.recv() else {
                debug!("orders for {} closed, detaching", self.tid);
                self.detach()?;
                return Ok(Flow::Detached);
            };

            match order {
                Order::Continue(signal, reply) => {
                    let res = self.resume(signal);
                    let resumed = res.is_ok();
                    let _ = reply.send(res);
                    if resumed {
                        return Ok(Flow::Running);
                    }
                }
                Order::RunSyscall(call, reply) => {
                    let mut held = vec![];
                    let res = inject::run_syscall(self.tid, &call, &mut held);
                    self.requeue(held);
                    let _ = reply.send(res);
                }
                Order::InStop(f) => f(self.tid),
                Order::Detach(reply) => {
                    let res = self.detach();
                    let detached = res.is_ok();
                    let _ = reply.send(res);
                    if detached {
                        return Ok(Flow::Detached);
                    }
                }
            }
        }
    }

    fn resume(&self, signal: Option<Signal>) -> Result<()> {
        let reason = self.shared.mailbox.take();
        self.shared.set_state(TaskState::Running);

        if let Err(e) = self.restart(signal) {
            self.shared.set_state(TaskState::Stopped);
            if let Some(reason) = reason {
                self.shared.mailbox.publish(reason);
            }
            return Err(e);
        }
        Ok(())
    }

    fn restart(&self, signal: Option<Signal>) -> Result<()> {
        let res = if self.options.strace.is_some() {
            ptrace::syscall(self.tid, signal)
        } else {
            ptrace::cont(self.tid, signal)
        };
        res.with_context(|| format!("could not continue {}", self.tid))
    }

    fn trace_syscall(&mut self) -> Result<()> {
        let entering = !self.in_syscall;
        self.in_syscall = entering;
        if let (Some(writer), true) = (&self.options.strace, entering) {
            let regs = Registers::read(self.tid)?;
            writer.write_line(&strace::format_syscall(regs.syscall_nr()))?;
        }
        ptrace::syscall(self.tid, None).with_context(|| format!("could not continue {}", self.tid))
    }

    /// Puts signals that arrived during an injection back into the queue.
    fn requeue(&self, held: Vec<Signal>) {
        for sig in held {
            if sig == Signal::SIGSTOP && self.shared.mailbox.swallow_stray() {
                continue;
            }
            debug!("requeueing {sig:?} for {}", self.tid);
            if let Err(e) = tgkill(self.pid, self.tid, sig) {
                warn!("lost {sig:?} of {}: {e:#}", self.tid);
            }
        }
    }

    fn detach(&self) -> Result<()> {
        if self.shared.mailbox.swallow_stray() {
            // flushes the queued SIGSTOP, which would stop the released thread
            tgkill(self.pid, self.tid, Signal::SIGCONT)?;
        }
        ptrace::detach(self.tid, None).with_context(|| format!("could not detach from {}", self.tid))?;
        self.shared.finish(TaskState::Detached);
        debug!("detached from {}", self.tid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_to_missing_thread() {
        let missing = Pid::from_raw(i32::MAX);
        let err = TraceTask::attach(missing, missing, &TraceOptions::default())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("could not seize"));
    }

    #[test]
    fn test_trace_options() {
        assert!(TraceOptions::default().ptrace_options().is_empty());
        assert_eq!(
            TraceOptions::with_strace(SafeWriter::new(std::io::sink())).ptrace_options(),
            Options::PTRACE_O_TRACESYSGOOD
        );
    }
}
