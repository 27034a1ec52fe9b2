#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("refunction only supports x86_64 linux");

pub mod args;
pub mod controller;
pub mod ptrace;
pub mod state;
pub mod worker;

use std::{
    fs,
    io::{self, BufRead, Write},
    process::{self, Command},
};

use clap::Parser;
use refunction_common::{
    anyhow::{anyhow, Context, Result},
    serde_json::{self, Value},
    tracing::{error, info},
};

pub use crate::{
    args::Args,
    controller::Controller,
    ptrace::{SafeWriter, TraceOptions},
    state::ProcessState,
    worker::Worker,
};

pub fn main() {
    refunction_common::tracing::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let function = fs::read_to_string(&args.function)
        .with_context(|| format!("could not read {}", args.function.display()))?;

    let (program, rest) = args
        .exec
        .split_first()
        .ok_or_else(|| anyhow!("no runtime command given"))?;
    let options = if args.strace {
        TraceOptions::with_strace(SafeWriter::new(io::stderr()))
    } else {
        TraceOptions::default()
    };

    let mut worker = Worker::spawn(Command::new(program).args(rest), options)?;
    worker.activate()?;
    worker.send_function(&function)?;
    info!("serving requests");

    let mut stdout = io::stdout().lock();
    let mut served = 0;
    for line in io::stdin().lock().lines() {
        let line = line.context("could not read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = serde_json::from_str(&line).context("could not parse request")?;

        if args.restore && served > 0 {
            worker.restore()?;
            worker.send_function(&function)?;
        }

        let response = worker.send_request(request)?;
        writeln!(stdout, "{response}").context("could not write response")?;
        served += 1;
    }

    worker.end()
}
