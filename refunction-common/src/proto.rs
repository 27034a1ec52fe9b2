use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracee finished initialisation and is ready to be checkpointed.
pub const STARTED: &str = "started";
/// Tracee diagnostics, dropped by the reader.
pub const INFO: &str = "info";
/// Tracee diagnostics, dropped by the reader.
pub const LOG: &str = "log";
/// Handler source sent to the tracee.
pub const FUNCTION: &str = "function";
/// Result of installing a handler, `data` is a boolean.
pub const FUNCTION_LOADED: &str = "function_loaded";
/// Invocation of the installed handler.
pub const REQUEST: &str = "request";
/// Handler result.
pub const RESPONSE: &str = "response";

/// One line of the stdio protocol spoken with a function runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Diagnostic messages never reach a waiting caller.
    pub fn is_log(&self) -> bool {
        self.is(INFO) || self.is(LOG)
    }

    /// Parses a single line; the trailing newline is optional.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end()).context("could not parse message")
    }

    /// Encodes the message followed by the `\n` delimiter.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self).context("could not encode message")?;
        buf.push(b'\n');
        Ok(buf)
    }
}
