use std::{
    io::{Read, Write},
    process::{Child, Command, Stdio},
};

use refunction_common::{
    anyhow::{anyhow, bail, Context, Result},
    nix::unistd::Pid,
    proto::{self, Message},
    serde_json::Value,
    tracing::{debug, info, warn},
    transport::{self, MessageReader, MessageWriter},
};

use crate::{controller::Controller, ptrace::TraceOptions};

type Stdin = MessageWriter<Box<dyn Write + Send>>;

/// A function runtime driven over its stdio and rewound between invocations.
pub struct Worker {
    controller: Controller,
    stdin: Option<Stdin>,
    messages: MessageReader,
    child: Option<Child>,
}

impl Worker {
    /// Wraps an already running runtime whose stdio pair is `stdin`/`stdout`.
    pub fn new(
        controller: Controller,
        stdin: impl Write + Send + 'static,
        stdout: impl Read + Send + 'static,
    ) -> Result<Self> {
        Ok(Self {
            controller,
            stdin: Some(MessageWriter::new(Box::new(stdin))),
            messages: MessageReader::spawn(stdout)?,
            child: None,
        })
    }

    /// Starts `command` with piped stdio. Its stderr is logged.
    pub fn spawn(command: &mut Command, options: TraceOptions) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not spawn {:?}", command.get_program()))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("worker has no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("worker has no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("worker has no stderr"))?;
        transport::drain_stderr(stderr)?;

        let pid = Pid::from_raw(child.id() as i32);
        info!(%pid, "spawned {:?}", command.get_program());

        let controller = Controller::new(pid).with_options(options);
        let mut worker = Self::new(controller, stdin, stdout)?;
        worker.child = Some(child);
        Ok(worker)
    }

    pub fn pid(&self) -> Pid {
        self.controller.pid()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Waits for the runtime to start, then attaches and checkpoints it.
    pub fn activate(&mut self) -> Result<()> {
        self.controller.activate(&self.messages)
    }

    /// Installs `source` as the handler of the runtime.
    pub fn send_function(&mut self, source: &str) -> Result<()> {
        self.send_message(proto::FUNCTION, source.into())?;
        let loaded = self.await_message(proto::FUNCTION_LOADED)?;
        if loaded.data != Value::Bool(true) {
            bail!("function failed to load");
        }
        debug!("function loaded into {}", self.pid());
        Ok(())
    }

    /// Invokes the installed handler and returns its result.
    pub fn send_request(&mut self, request: Value) -> Result<Value> {
        self.send_message(proto::REQUEST, request)?;
        Ok(self.await_message(proto::RESPONSE)?.data)
    }

    pub fn send_message(&mut self, kind: &str, data: Value) -> Result<()> {
        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow!("worker {} has ended", self.controller.pid()))?
            .send(&Message::new(kind, data))
    }

    pub fn await_message(&self, kind: &str) -> Result<Message> {
        self.messages.await_message(kind)
    }

    pub fn restore(&self) -> Result<()> {
        self.controller.restore()
    }

    /// Detaches, closes stdin and kills the runtime if it was spawned here.
    pub fn end(&mut self) -> Result<()> {
        let detached = self.controller.end();
        self.stdin.take();

        if let Some(mut child) = self.child.take() {
            let pid = self.pid();
            match child.kill() {
                Ok(_) => debug!("killed {pid}"),
                Err(e) => warn!("could not kill {pid}: {e:?}"),
            }
            if let Err(e) = child.wait() {
                debug!("could not reap {pid}: {e}");
            }
        }

        detached
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.end() {
                warn!("could not end worker: {e:#}");
            }
        }
    }
}
