use std::{io::Write, thread, time::Instant};

use refunction_common::{
    anyhow::{self, anyhow, bail, Context, Result},
    nix::{errno::Errno, sys::signal::Signal, unistd::Pid},
    procfs::process::Process,
    proto,
    tracing::{debug, info, warn},
    transport::MessageReader,
};

use crate::{
    ptrace::{self, SafeWriter, TaskState, TraceOptions, TraceTask},
    state::{self, ProcessState},
};

/// Supervises every thread of one traced process and owns its checkpoints.
pub struct Controller {
    pid: Pid,
    options: TraceOptions,
    tasks: Vec<TraceTask>,
    checkpoints: Vec<ProcessState>,
}

impl Controller {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            options: TraceOptions::default(),
            tasks: vec![],
            checkpoints: vec![],
        }
    }

    pub fn with_options(mut self, options: TraceOptions) -> Self {
        self.options = options;
        self
    }

    /// Writes the name of every syscall entered by the tracee to `writer`.
    pub fn with_syscall_trace(self, writer: impl Write + Send + 'static) -> Self {
        self.with_options(TraceOptions::with_strace(SafeWriter::new(writer)))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tasks(&self) -> &[TraceTask] {
        &self.tasks
    }

    pub fn task(&self, tid: Pid) -> Option<&TraceTask> {
        self.tasks.iter().find(|t| t.tid() == tid)
    }

    fn leader(&self) -> Result<&TraceTask> {
        self.task(self.pid)
            .ok_or_else(|| anyhow!("not attached to {}", self.pid))
    }

    /// Waits for the tracee to report `started`, then attaches and takes the
    /// initial checkpoint.
    pub fn activate(&mut self, messages: &MessageReader) -> Result<()> {
        messages
            .await_message(proto::STARTED)
            .context("tracee never reported started")?;
        self.attach()?;
        self.take_checkpoint()
    }

    /// Seizes every thread currently listed under `/proc/<pid>/task`.
    pub fn attach(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            bail!("already attached to {}", self.pid);
        }

        let proc = Process::new(self.pid.as_raw())
            .with_context(|| format!("could not open process {}", self.pid))?;
        let mut tids = proc
            .tasks()
            .with_context(|| format!("could not list tasks of {}", self.pid))?
            .map(|t| t.map(|t| Pid::from_raw(t.tid)).context("task"))
            .collect::<Result<Vec<_>>>()?;
        // leader first
        tids.sort_by_key(|tid| *tid != self.pid);

        let mut tasks = Vec::with_capacity(tids.len());
        for tid in tids {
            match TraceTask::attach(self.pid, tid, &self.options) {
                Ok(task) => tasks.push(task),
                Err(e) if tid != self.pid && is_gone(&e) => {
                    debug!("thread {tid} exited before it could be seized");
                }
                Err(e) => {
                    if let Err(released) = release(&tasks) {
                        warn!("could not release {}: {released:#}", self.pid);
                    }
                    return Err(e);
                }
            }
        }

        self.tasks = tasks;
        info!(pid = %self.pid, "attached to {} threads", self.tasks.len());
        Ok(())
    }

    pub fn take_checkpoint(&mut self) -> Result<()> {
        let start = Instant::now();
        self.stop_all()?;

        let checkpoint = self.capture_checkpoint();
        self.continue_all()?;
        let checkpoint = checkpoint.context("could not take checkpoint")?;

        info!(
            pid = %self.pid,
            "checkpoint {} of {} bytes took {:?}",
            self.checkpoints.len(),
            checkpoint.memory_size(),
            start.elapsed()
        );
        self.checkpoints.push(checkpoint);
        Ok(())
    }

    fn capture_checkpoint(&self) -> Result<ProcessState> {
        let mut checkpoint = ProcessState::capture(self.pid, &self.tasks)?;
        checkpoint.save_writable_pages()?;
        state::clear_soft_dirty(self.pid)?;
        Ok(checkpoint)
    }

    /// Rewinds the tracee to its initial checkpoint.
    ///
    /// On failure the tracee is left stopped.
    pub fn restore(&self) -> Result<()> {
        let Some(checkpoint) = self.checkpoints.first() else {
            bail!("no checkpoints to restore");
        };
        let start = Instant::now();
        self.stop_all()?;
        let leader = self.leader()?;

        let mut fixup = false;
        if checkpoint.program_break_changed()? {
            fixup = true;
            checkpoint.restore_program_break(leader)?;
        }
        if checkpoint.num_memory_locations_changed()? {
            fixup = true;
            checkpoint.unmap_new_locations(leader)?;
        }
        if fixup {
            checkpoint.fixup_syscall_state(leader)?;
        }

        let pages = checkpoint.restore_dirty_pages()?;
        checkpoint.restore_registers(&self.tasks)?;
        self.continue_all()?;

        info!(
            pid = %self.pid,
            "restore of {pages} pages took {:?}",
            start.elapsed()
        );
        Ok(())
    }

    /// Stops every thread, concurrently.
    pub fn stop_all(&self) -> Result<()> {
        thread::scope(|s| {
            let stops: Vec<_> = self.tasks.iter().map(|t| s.spawn(|| t.stop())).collect();
            stops
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("stop thread panicked"))))
                .collect::<Result<Vec<_>>>()
        })?;
        debug!("stopped {} threads of {}", self.tasks.len(), self.pid);
        Ok(())
    }

    pub fn continue_all(&self) -> Result<()> {
        self.continue_with(None)
    }

    pub fn continue_with(&self, signal: Option<Signal>) -> Result<()> {
        for task in &self.tasks {
            task.cont(signal)?;
        }
        Ok(())
    }

    pub fn continue_tid(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        self.task(tid)
            .ok_or_else(|| anyhow!("thread {tid} is not traced"))?
            .cont(signal)
    }

    /// Sends `signal` to the thread group leader.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        ptrace::tgkill(self.pid, self.pid, signal)
    }

    /// Sends `signal` and lets it through to the tracee when it is traced.
    pub fn send_signal_cont(&self, signal: Signal) -> Result<()> {
        self.send_signal(signal)?;
        if self.tasks.is_empty() {
            return Ok(());
        }

        let leader = self.leader()?;
        loop {
            let reason = leader.wait_stop()?;
            leader.cont(reason.reinject())?;
            if reason.signal() == signal {
                return Ok(());
            }
        }
    }

    /// Waits until the leader stops with `signal`, which is suppressed.
    ///
    /// Any other signal is passed on. The tracee keeps running.
    pub fn await_signal(&self, signal: Signal) -> Result<()> {
        let leader = self.leader()?;
        loop {
            let reason = leader.wait_stop()?;
            if reason.signal() == signal {
                debug!("{} received {signal:?}", self.pid);
                return leader.cont(None);
            }
            leader.cont(reason.reinject())?;
        }
    }

    /// Like [`Controller::await_signal`] but the leader stays stopped, its stop
    /// token still in place for the next consumer.
    pub fn pause_at_signal(&self, signal: Signal) -> Result<()> {
        let leader = self.leader()?;
        loop {
            let reason = leader.wait_stop()?;
            if reason.signal() == signal {
                debug!("{} paused at {signal:?}", self.pid);
                return Ok(());
            }
            leader.cont(reason.reinject())?;
        }
    }

    /// Captures the current state of the stopped tracee without page contents.
    pub fn state(&self) -> Result<ProcessState> {
        ProcessState::capture(self.pid, &self.tasks)
    }

    pub fn checkpoints(&self) -> &[ProcessState] {
        &self.checkpoints
    }

    pub fn initial_checkpoint(&self) -> Result<&ProcessState> {
        self.checkpoints
            .first()
            .ok_or_else(|| anyhow!("no initial checkpoint"))
    }

    pub fn set_regs(&self, state: &ProcessState) -> Result<()> {
        state.restore_registers(&self.tasks)
    }

    pub fn clear_mem_refs(&self) -> Result<()> {
        state::clear_soft_dirty(self.pid)
    }

    pub fn is_attached(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Releases every thread, also when some of them fail to detach.
    pub fn detach(&mut self) -> Result<()> {
        let released = release(&self.tasks);
        self.tasks.clear();
        released?;
        info!(pid = %self.pid, "detached");
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        if self.is_attached() {
            self.detach()?;
        }
        Ok(())
    }
}

/// Stops and detaches every task, carrying on past failures.
///
/// Returns the first error.
fn release(tasks: &[TraceTask]) -> Result<()> {
    let mut first = None;
    for task in tasks {
        if let TaskState::Exited | TaskState::Detached = task.state() {
            continue;
        }
        if let Err(e) = task.stop().and_then(|_| task.detach()) {
            warn!("could not detach from {}: {e:#}", task.tid());
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// The thread vanished between listing and seizing it.
fn is_gone(err: &anyhow::Error) -> bool {
    err.root_cause().downcast_ref::<Errno>() == Some(&Errno::ESRCH)
}
