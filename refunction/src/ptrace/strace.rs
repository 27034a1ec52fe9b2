use std::{
    fmt,
    io::Write,
    sync::{Arc, Mutex, PoisonError},
};

use refunction_common::{
    anyhow::{Context, Result},
    syscalls::Sysno,
};

/// A writer shared by every trace thread; each line is written under one lock.
#[derive(Clone)]
pub struct SafeWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SafeWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .context("could not write strace line")
    }
}

impl fmt::Debug for SafeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SafeWriter")
    }
}

pub(crate) fn format_syscall(nr: i64) -> String {
    match usize::try_from(nr).ok().and_then(Sysno::new) {
        Some(sysno) => format!("syscall: {}\n", sysno.name()),
        None => format!("unknown syscall: {nr}\n"),
    }
}
