//! Non-blocking writes to a child's stdin

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{ProcessError, Result};
use crate::lifecycle::LifecyclePhase;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Debug)]
enum StdinCommand {
    Write(Vec<u8>),
    Close,
}

/// Handle queueing text to a child's stdin
///
/// Writes are handed to a writer task owning the pipe, so callers (observers
/// included) never block on a full pipe. The writer stops on `close`, on the
/// first write error, or when the process exits.
#[derive(Debug, Clone)]
pub struct StdinInjection {
    tx: mpsc::UnboundedSender<StdinCommand>,
    pid: u32,
}

impl StdinInjection {
    pub(crate) fn spawn(
        stdin: Option<ChildStdin>,
        pid: u32,
        phase: watch::Receiver<LifecyclePhase>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdin) = stdin {
            tokio::spawn(run_writer(stdin, rx, phase, pid));
        }
        Self { tx, pid }
    }

    /// Queue raw text
    pub fn write(&self, text: &str) -> Result<()> {
        self.send(StdinCommand::Write(text.as_bytes().to_vec()))
    }

    /// Queue text followed by a line terminator
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + LINE_ENDING.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(LINE_ENDING.as_bytes());
        self.send(StdinCommand::Write(bytes))
    }

    /// Close the pipe once queued writes are flushed
    pub fn close(&self) -> Result<()> {
        self.send(StdinCommand::Close)
    }

    /// True while the writer accepts data
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, command: StdinCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ProcessError::StdinClosed { pid: self.pid })
    }
}

async fn exited(phase: &mut watch::Receiver<LifecyclePhase>) {
    let _ = phase.wait_for(|p| *p >= LifecyclePhase::Exited).await;
}

async fn run_writer(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinCommand>,
    mut phase: watch::Receiver<LifecyclePhase>,
    pid: u32,
) {
    loop {
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = exited(&mut phase) => None,
        };

        match command {
            Some(StdinCommand::Write(bytes)) => {
                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    debug!(pid, error = %e, "Stdin write failed");
                    break;
                }
            }
            Some(StdinCommand::Close) | None => break,
        }
    }

    rx.close();
    trace!(pid, "Stdin writer stopped");
}
