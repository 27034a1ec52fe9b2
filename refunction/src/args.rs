use std::path::PathBuf;

use clap::Parser;

/// Serves requests from a function runtime that is rewound between calls.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Source of the handler installed into the runtime
    #[arg(long)]
    pub function: PathBuf,

    /// Print every syscall made by the runtime to stderr
    #[arg(long)]
    pub strace: bool,

    /// Rewind the runtime to its activation checkpoint before every request but the first
    #[arg(long)]
    pub restore: bool,

    /// The runtime command
    #[arg(last = true, required = true)]
    pub exec: Vec<String>,
}
