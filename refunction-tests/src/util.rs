use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{self, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use refunction::{TraceOptions, Worker};
use refunction_common::nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

const OUTPUT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    refunction_common::tracing::init();
}

pub struct ChildWithStreamedOutput {
    pub proc: process::Child,
    pub stdout: Arc<Mutex<String>>,
    pub stderr: Arc<Mutex<String>>,
}

impl ChildWithStreamedOutput {
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.proc.id() as _)
    }

    pub fn signal(&mut self, signal: Signal) {
        signal::kill(self.pid(), signal).unwrap();
    }

    pub fn stdout(&self) -> String {
        self.stdout.lock().unwrap().clone()
    }
}

impl Drop for ChildWithStreamedOutput {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}

fn stream(mut pipe: impl Read + Send + 'static, pid: u32, buf: Arc<Mutex<String>>) {
    thread::spawn(move || {
        let mut bbuf = [0u8; 1024];
        loop {
            let len = match pipe.read(&mut bbuf) {
                Ok(0) | Err(_) => break,
                Ok(len) => len,
            };
            let out = String::from_utf8_lossy(&bbuf[..len]).to_string();
            print!("{}", out.replace('\n', &format!("\n [{pid}] ")));
            buf.lock().unwrap().push_str(out.as_str());
        }
    });
}

pub fn spawn(cmd: &mut process::Command) -> ChildWithStreamedOutput {
    let mut proc = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn");

    let stdout = Arc::new(Mutex::new("".to_string()));
    let stderr = Arc::new(Mutex::new("".to_string()));

    let pid = proc.id();
    stream(proc.stdout.take().unwrap(), pid, stdout.clone());
    stream(proc.stderr.take().unwrap(), pid, stderr.clone());

    ChildWithStreamedOutput {
        proc,
        stdout,
        stderr,
    }
}

pub fn wait_for_output(child: &ChildWithStreamedOutput, contents: &str) {
    let start = Instant::now();
    loop {
        for out in [&child.stdout, &child.stderr] {
            let out = out.lock().unwrap();
            if out.contains(contents) {
                return;
            }
        }

        assert!(
            start.elapsed() < OUTPUT_TIMEOUT,
            "timed out waiting for {contents:?}"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

/// Numbers printed after `prefix` on each complete line, in order.
pub fn counters(output: &str, prefix: &str) -> Vec<u64> {
    output
        .split_inclusive('\n')
        .filter_map(|l| l.strip_suffix('\n'))
        .filter_map(|l| l.strip_prefix(prefix))
        .filter_map(|rest| rest.split_whitespace().next()?.parse().ok())
        .collect()
}

/// Writer that keeps everything written to it, for inspecting strace output.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn python_available() -> bool {
    process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn tracee_script(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tracees")
        .join(name)
}

/// Spawns the python function runtime, or `None` when there is no `python3`.
pub fn python_worker() -> Option<Worker> {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return None;
    }

    let worker = Worker::spawn(
        process::Command::new("python3")
            .arg("-u")
            .arg(tracee_script("serverless-function.py")),
        TraceOptions::default(),
    )
    .unwrap();
    Some(worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let out = "at: 1\nat: 2\n [12] grown: 3 break: 0x1\nat: x\nat: 4\nat: 5";
        // the last line is still being written
        assert_eq!(counters(out, "at: "), vec![1, 2, 4]);
        assert_eq!(counters("grown: 3 break: 0x55\n", "grown: "), vec![3]);
    }
}
