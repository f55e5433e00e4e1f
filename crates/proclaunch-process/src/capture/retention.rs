use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use super::{CaptureObserver, CaptureScope, LineEntry, StreamClosed, StreamKind};
use crate::error::{ProcessError, Result};

/// Observer keeping every captured line in memory
///
/// Only lines of streams inside its own scope are kept. Readers can wait for
/// the close of a stream to be sure nothing more will come.
#[derive(Debug)]
pub struct OutputRetention {
    scope: CaptureScope,
    entries: RwLock<Vec<LineEntry>>,
    stdout_closed: watch::Sender<bool>,
    stderr_closed: watch::Sender<bool>,
}

impl OutputRetention {
    pub fn new(scope: CaptureScope) -> Self {
        Self {
            scope,
            entries: RwLock::new(Vec::new()),
            stdout_closed: watch::Sender::new(false),
            stderr_closed: watch::Sender::new(false),
        }
    }

    pub fn scope(&self) -> CaptureScope {
        self.scope
    }

    fn closed_flag(&self, stream: StreamKind) -> &watch::Sender<bool> {
        match stream {
            StreamKind::Stdout => &self.stdout_closed,
            StreamKind::Stderr => &self.stderr_closed,
        }
    }

    pub fn is_closed(&self, stream: StreamKind) -> bool {
        *self.closed_flag(stream).borrow()
    }

    /// Wait until `stream` is reported closed
    pub async fn wait_stream_closed(&self, stream: StreamKind) {
        let mut rx = self.closed_flag(stream).subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Wait until both streams are reported closed
    pub async fn wait_all_closed(&self) {
        self.wait_stream_closed(StreamKind::Stdout).await;
        self.wait_stream_closed(StreamKind::Stderr).await;
    }

    /// Copy of the kept entries, in arrival order
    pub fn entries(&self) -> Vec<LineEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn lines(&self, stream: Option<StreamKind>, keep_blank: bool) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|entry| stream.map_or(true, |s| entry.stream() == s))
            .filter(|entry| keep_blank || !entry.line().trim().is_empty())
            .map(|entry| entry.line().to_string())
            .collect()
    }

    pub fn stdout_lines(&self, keep_blank: bool) -> Vec<String> {
        self.lines(Some(StreamKind::Stdout), keep_blank)
    }

    pub fn stderr_lines(&self, keep_blank: bool) -> Vec<String> {
        self.lines(Some(StreamKind::Stderr), keep_blank)
    }

    /// Lines of both streams, interleaved in arrival order
    pub fn all_lines(&self, keep_blank: bool) -> Vec<String> {
        self.lines(None, keep_blank)
    }

    pub fn stdout_text(&self, keep_blank: bool) -> String {
        self.stdout_lines(keep_blank).join("\n")
    }

    pub fn stderr_text(&self, keep_blank: bool) -> String {
        self.stderr_lines(keep_blank).join("\n")
    }

    pub fn all_text(&self, keep_blank: bool) -> String {
        self.all_lines(keep_blank).join("\n")
    }
}

impl CaptureObserver for OutputRetention {
    fn on_line(&self, entry: &LineEntry) -> Result<()> {
        if !self.scope.includes(entry.stream()) {
            return Ok(());
        }
        if self.is_closed(entry.stream()) {
            return Err(ProcessError::LineAfterStreamClosed {
                stream: entry.stream(),
            });
        }
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn on_stream_closed(&self, closed: &StreamClosed) -> Result<()> {
        trace!(pid = closed.source.pid(), stream = %closed.stream, outcome = ?closed.outcome, "Retention stream closed");
        self.closed_flag(closed.stream).send_replace(true);
        Ok(())
    }
}
