use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CaptureObserver, CaptureScope, LineEntry, StreamClosed, StreamKind};
use crate::end_status::EndStatus;
use crate::error::Result;
use crate::lifecycle::ProcessLifecycle;

type Sink = Mutex<Box<dyn Write + Send>>;
type FilterFn = dyn Fn(&LineEntry) -> bool + Send + Sync;

/// Observer echoing process output, prefixed with `<exec>#<pid>`
///
/// ```text
/// ffmpeg#4242	> frame=  120 fps= 60
/// ffmpeg#4242	! Unknown encoder 'x'
/// ffmpeg#4242 Ends done_with_error return 1 in 350 msec
/// ```
pub struct PrintObserver {
    out: Sink,
    err: Sink,
    filter: Option<Arc<FilterFn>>,
    end_summary: bool,
}

impl Default for PrintObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PrintObserver {
    /// Print to the host stdout and stderr
    pub fn new() -> Self {
        Self::with_sinks(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn with_sinks(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            err: Mutex::new(err),
            filter: None,
            end_summary: false,
        }
    }

    /// Only print lines accepted by `filter`
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&LineEntry) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Print a summary line when the process ends
    pub fn with_end_summary(mut self, end_summary: bool) -> Self {
        self.end_summary = end_summary;
        self
    }

    fn write_end_summary(&self, source: &ProcessLifecycle, scope: CaptureScope) -> io::Result<()> {
        let status = source.end_status();
        if scope == CaptureScope::Both && status == EndStatus::CorrectlyDone {
            return Ok(());
        }

        let mut summary = format!("{} Ends {}", prefix(source), status);
        if status != EndStatus::CorrectlyDone {
            if let Some(code) = source.try_exit_code() {
                summary.push_str(&format!(" return {code}"));
            }
        }
        summary.push_str(&format!(" in {}", format_elapsed(source.uptime())));

        let sink = if status == EndStatus::CorrectlyDone {
            &self.out
        } else {
            &self.err
        };
        let mut sink = sink.lock();
        writeln!(sink, "{summary}")?;
        sink.flush()
    }
}

fn prefix(source: &ProcessLifecycle) -> String {
    format!("{}#{}", source.executable_name(), source.pid())
}

/// First stream the engine reads; its close carries the summary
fn summary_stream(scope: CaptureScope) -> StreamKind {
    if scope.includes(StreamKind::Stdout) {
        StreamKind::Stdout
    } else {
        StreamKind::Stderr
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{} msec", elapsed.as_millis())
    } else {
        format!("{} sec", elapsed.as_secs())
    }
}

impl CaptureObserver for PrintObserver {
    fn on_line(&self, entry: &LineEntry) -> Result<()> {
        if let Some(filter) = &self.filter {
            if !filter(entry) {
                return Ok(());
            }
        }

        let (sink, marker) = match entry.stream() {
            StreamKind::Stdout => (&self.out, '>'),
            StreamKind::Stderr => (&self.err, '!'),
        };
        let mut sink = sink.lock();
        writeln!(sink, "{}\t{} {}", prefix(entry.source()), marker, entry.line())?;
        sink.flush()?;
        Ok(())
    }

    fn on_stream_closed(&self, closed: &StreamClosed) -> Result<()> {
        if self.end_summary && closed.stream == summary_stream(closed.scope) {
            self.write_end_summary(&closed.source, closed.scope)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PrintObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrintObserver")
            .field("filter", &self.filter.is_some())
            .field("end_summary", &self.end_summary)
            .finish()
    }
}
