use std::{
    io::{BufRead, BufReader, Read, Write},
    sync::mpsc::{self, Receiver, SyncSender},
    thread,
};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, trace};

use crate::proto::Message;

/// Writing half of the protocol, attached to the tracee's stdin.
pub struct MessageWriter<W: Write> {
    inner: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn send(&mut self, msg: &Message) -> Result<()> {
        let line = msg.to_line()?;
        self.inner
            .write_all(&line)
            .context("could not write to worker stdin")?;
        self.inner.flush().context("could not flush worker stdin")?;
        trace!("sent {} message", msg.kind);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reading half of the protocol.
///
/// A background thread splits the tracee's stdout into lines and forwards every
/// non-diagnostic message through a channel of depth one.
pub struct MessageReader {
    messages: Receiver<Message>,
}

impl MessageReader {
    pub fn spawn<R: Read + Send + 'static>(stdout: R) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("refunction-stdout".to_string())
            .spawn(move || forward_messages(BufReader::new(stdout), tx))
            .context("could not spawn stdout reader")?;

        Ok(Self { messages: rx })
    }

    /// Blocks until a message of `kind` arrives, discarding any other kind.
    pub fn await_message(&self, kind: &str) -> Result<Message> {
        loop {
            let msg = self
                .messages
                .recv()
                .map_err(|_| anyhow!("worker stdout closed while awaiting {kind}"))?;

            if msg.is(kind) {
                return Ok(msg);
            }
            debug!("discarding {} message while awaiting {kind}", msg.kind);
        }
    }
}

fn forward_messages<R: BufRead>(stdout: R, tx: SyncSender<Message>) {
    for line in stdout.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("stopped reading worker stdout: {e}");
                return;
            }
        };

        let msg = match Message::from_line(&line) {
            Ok(msg) => msg,
            Err(_) => {
                debug!("{line}");
                continue;
            }
        };

        if msg.is_log() {
            debug!("{}: {}", msg.kind, msg.data);
            continue;
        }

        if tx.send(msg).is_err() {
            return;
        }
    }
}

/// Logs every line of the tracee's stderr until it is closed.
pub fn drain_stderr<R: Read + Send + 'static>(stderr: R) -> Result<()> {
    thread::Builder::new()
        .name("refunction-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                debug!("stderr: {line}");
            }
        })
        .context("could not spawn stderr reader")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;
    use crate::proto::{FUNCTION_LOADED, RESPONSE, STARTED};

    #[test]
    fn test_writer_and_reader() {
        let mut writer = MessageWriter::new(vec![]);
        writer.send(&Message::new(STARTED, "")).unwrap();
        writer.send(&Message::new(RESPONSE, json!({"a": 1}))).unwrap();

        let reader = MessageReader::spawn(Cursor::new(writer.into_inner())).unwrap();
        assert_eq!(reader.await_message(STARTED).unwrap().data, json!(""));
        assert_eq!(reader.await_message(RESPONSE).unwrap().data, json!({"a": 1}));
    }

    #[test]
    fn test_reader_skips_logs_and_garbage() {
        let stdout = concat!(
            "Pid: 42\n",
            "{\"type\": \"log\", \"data\": \"python started\"}\n",
            "{\"type\": \"info\", \"data\": 1}\n",
            "{not json\n",
            "{\"type\": \"function_loaded\", \"data\": false}\n",
        );

        let reader = MessageReader::spawn(Cursor::new(stdout)).unwrap();
        let msg = reader.await_message(FUNCTION_LOADED).unwrap();
        assert_eq!(msg.data, json!(false));
    }

    #[test]
    fn test_reader_errors_when_stream_closes() {
        let reader = MessageReader::spawn(Cursor::new("{\"type\": \"started\"}\n")).unwrap();

        let err = reader.await_message(RESPONSE).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
