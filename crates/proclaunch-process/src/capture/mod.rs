//! Line-oriented capture of a process output
//!
//! [`OutputCapture`] runs one reader task per captured stream. Every line is
//! turned into a [`LineEntry`] and handed to the registered
//! [`CaptureObserver`]s. Once a stream ends and the process has exited, every
//! observer is told exactly once per stream with [`StreamClosed`].
//!
//! Lines of one stream arrive in order; there is no ordering between stdout
//! and stderr.

mod interactive;
mod print;
mod retention;

pub use interactive::InteractiveObserver;
pub use print::PrintObserver;
pub use retention::OutputRetention;

use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{error, trace, warn};

use crate::error::{ProcessError, Result};
use crate::lifecycle::ProcessLifecycle;

/// Output stream of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

/// Streams a capture engine or an observer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureScope {
    StdoutOnly,
    StderrOnly,
    Both,
}

impl CaptureScope {
    pub fn includes(self, stream: StreamKind) -> bool {
        matches!(
            (self, stream),
            (CaptureScope::Both, _)
                | (CaptureScope::StdoutOnly, StreamKind::Stdout)
                | (CaptureScope::StderrOnly, StreamKind::Stderr)
        )
    }
}

/// One captured line
#[derive(Clone)]
pub struct LineEntry {
    timestamp: DateTime<Utc>,
    line: String,
    stream: StreamKind,
    source: ProcessLifecycle,
}

impl LineEntry {
    pub fn new(line: impl Into<String>, stream: StreamKind, source: ProcessLifecycle) -> Self {
        Self {
            timestamp: Utc::now(),
            line: line.into(),
            stream,
            source,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Line content, without the line terminator
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn is_stdout(&self) -> bool {
        self.stream == StreamKind::Stdout
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == StreamKind::Stderr
    }

    /// Process that wrote the line
    pub fn source(&self) -> &ProcessLifecycle {
        &self.source
    }
}

impl fmt::Debug for LineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineEntry")
            .field("timestamp", &self.timestamp)
            .field("line", &self.line)
            .field("stream", &self.stream)
            .field("pid", &self.source.pid())
            .finish()
    }
}

impl fmt::Display for LineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.stream {
            StreamKind::Stdout => '>',
            StreamKind::Stderr => '!',
        };
        write!(f, "{} {} {}", self.timestamp.to_rfc3339(), marker, self.line)
    }
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// End of file, or the pipe was closed under the reader
    Eof,
    /// Read error
    Failed(String),
    /// The stream was not captured at all
    NotCaptured,
}

/// End-of-stream notification
#[derive(Debug, Clone)]
pub struct StreamClosed {
    pub source: ProcessLifecycle,
    pub stream: StreamKind,
    /// Scope of the capture engine
    pub scope: CaptureScope,
    pub outcome: StreamOutcome,
}

/// Receives captured lines
///
/// Called from the reader tasks; implementations must not block for long.
/// Errors are logged by the engine and never stop the capture.
pub trait CaptureObserver: Send + Sync {
    fn on_line(&self, entry: &LineEntry) -> Result<()>;

    fn on_stream_closed(&self, _closed: &StreamClosed) -> Result<()> {
        Ok(())
    }
}

type ObserverList = Arc<Vec<Arc<dyn CaptureObserver>>>;

/// Capture engine dispatching process output to observers
pub struct OutputCapture {
    scope: CaptureScope,
    observers: RwLock<ObserverList>,
}

impl OutputCapture {
    pub fn new(scope: CaptureScope) -> Self {
        Self {
            scope,
            observers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn scope(&self) -> CaptureScope {
        self.scope
    }

    /// True if `stream` is read by this engine
    pub fn captures(&self, stream: StreamKind) -> bool {
        self.scope.includes(stream)
    }

    /// Register an observer; lines already dispatched are not replayed
    pub fn add_observer(&self, observer: Arc<dyn CaptureObserver>) {
        let mut observers = self.observers.write();
        let mut updated = Vec::with_capacity(observers.len() + 1);
        updated.extend(observers.iter().cloned());
        updated.push(observer);
        *observers = Arc::new(updated);
    }

    /// Builder variant of [`OutputCapture::add_observer`]
    pub fn with_observer(self, observer: Arc<dyn CaptureObserver>) -> Self {
        self.add_observer(observer);
        self
    }

    /// Unregister an observer, compared by pointer
    pub fn remove_observer(&self, observer: &Arc<dyn CaptureObserver>) -> bool {
        let mut observers = self.observers.write();
        let updated: Vec<_> = observers
            .iter()
            .filter(|o| !Arc::ptr_eq(o, observer))
            .cloned()
            .collect();
        let removed = updated.len() != observers.len();
        *observers = Arc::new(updated);
        removed
    }

    /// Current observers
    pub fn observers(&self) -> ObserverList {
        Arc::clone(&self.observers.read())
    }

    /// Start reading the streams of a freshly spawned process
    pub(crate) fn attach(
        self: &Arc<Self>,
        lifecycle: &ProcessLifecycle,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) {
        match stdout.filter(|_| self.captures(StreamKind::Stdout)) {
            Some(pipe) => self.spawn_reader(pipe, StreamKind::Stdout, lifecycle),
            None => self.spawn_not_captured(StreamKind::Stdout, lifecycle),
        }
        match stderr.filter(|_| self.captures(StreamKind::Stderr)) {
            Some(pipe) => self.spawn_reader(pipe, StreamKind::Stderr, lifecycle),
            None => self.spawn_not_captured(StreamKind::Stderr, lifecycle),
        }
    }

    /// Uncaptured streams are closed at exit, like captured ones
    fn spawn_not_captured(self: &Arc<Self>, stream: StreamKind, lifecycle: &ProcessLifecycle) {
        let capture = Arc::clone(self);
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            lifecycle.wait_exited().await;
            capture.dispatch_closed(&lifecycle, stream, StreamOutcome::NotCaptured);
        });
    }

    fn spawn_reader<R>(self: &Arc<Self>, pipe: R, stream: StreamKind, lifecycle: &ProcessLifecycle)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = Arc::clone(self);
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let outcome = capture.read_lines(pipe, stream, &lifecycle).await;
            // Close notifications only once the end status is known
            lifecycle.wait_exited().await;
            capture.dispatch_closed(&lifecycle, stream, outcome);
        });
    }

    async fn read_lines<R>(&self, pipe: R, stream: StreamKind, lifecycle: &ProcessLifecycle) -> StreamOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return StreamOutcome::Eof,
                Ok(_) => {
                    let entry = LineEntry::new(decode_line(&buf), stream, lifecycle.clone());
                    self.dispatch_line(&entry);
                }
                Err(e) if is_close_signature(&e) => {
                    trace!(pid = lifecycle.pid(), %stream, error = %e, "Stream closed under reader");
                    return StreamOutcome::Eof;
                }
                Err(e) => {
                    warn!(pid = lifecycle.pid(), %stream, error = %e, "Failed to read process output");
                    return StreamOutcome::Failed(e.to_string());
                }
            }
        }
    }

    fn dispatch_line(&self, entry: &LineEntry) {
        trace!(pid = entry.source().pid(), stream = %entry.stream(), line = entry.line(), "Captured line");
        for observer in self.observers().iter() {
            if let Err(e) = observer.on_line(entry) {
                log_observer_error(entry.source(), &e);
            }
        }
    }

    fn dispatch_closed(&self, lifecycle: &ProcessLifecycle, stream: StreamKind, outcome: StreamOutcome) {
        let closed = StreamClosed {
            source: lifecycle.clone(),
            stream,
            scope: self.scope,
            outcome,
        };
        for observer in self.observers().iter() {
            if let Err(e) = observer.on_stream_closed(&closed) {
                log_observer_error(lifecycle, &e);
            }
        }
    }
}

impl fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCapture")
            .field("scope", &self.scope)
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

fn log_observer_error(source: &ProcessLifecycle, e: &ProcessError) {
    match e {
        ProcessError::LineAfterStreamClosed { .. } => {
            error!(pid = source.pid(), error = %e, "Line rejected by observer")
        }
        _ => warn!(pid = source.pid(), error = %e, "Capture observer failed"),
    }
}

/// Strip the terminator (`\n` or `\r\n`) and decode lossily
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Errors meaning the pipe went away rather than a real read failure
fn is_close_signature(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }

    #[cfg(unix)]
    {
        e.raw_os_error() == Some(nix::libc::EBADF)
    }

    #[cfg(windows)]
    {
        // ERROR_BROKEN_PIPE, ERROR_NO_DATA
        matches!(e.raw_os_error(), Some(109) | Some(232))
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
