use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{CaptureObserver, LineEntry, StreamClosed};
use crate::error::Result;

type ReplyFn = dyn Fn(&LineEntry) -> Option<String> + Send + Sync;
type DoneFn = dyn Fn(&StreamClosed) + Send + Sync;

/// Observer answering process output through its stdin
///
/// The reply function sees every line; a non-empty answer is written to the
/// process stdin, followed by a line terminator, while the process runs.
pub struct InteractiveObserver {
    reply: Arc<ReplyFn>,
    executor: Option<Handle>,
    on_done: Option<Arc<DoneFn>>,
}

impl InteractiveObserver {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&LineEntry) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            reply: Arc::new(reply),
            executor: None,
            on_done: None,
        }
    }

    /// Run the reply function on the blocking pool of `handle`
    pub fn with_executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    /// Called once per closed stream
    pub fn with_on_done<F>(mut self, on_done: F) -> Self
    where
        F: Fn(&StreamClosed) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(on_done));
        self
    }
}

fn respond(reply: &ReplyFn, entry: &LineEntry) -> Result<()> {
    let Some(answer) = reply(entry) else {
        return Ok(());
    };
    if answer.is_empty() {
        return Ok(());
    }

    let source = entry.source();
    if !source.is_running() {
        debug!(pid = source.pid(), "Process ended, reply dropped");
        return Ok(());
    }
    source.stdin().write_line(&answer)
}

impl CaptureObserver for InteractiveObserver {
    fn on_line(&self, entry: &LineEntry) -> Result<()> {
        let Some(handle) = &self.executor else {
            return respond(&*self.reply, entry);
        };

        let reply = Arc::clone(&self.reply);
        let entry = entry.clone();
        handle.spawn_blocking(move || {
            if let Err(e) = respond(&*reply, &entry) {
                warn!(pid = entry.source().pid(), error = %e, "Interactive reply failed");
            }
        });
        Ok(())
    }

    fn on_stream_closed(&self, closed: &StreamClosed) -> Result<()> {
        if let Some(on_done) = &self.on_done {
            on_done(closed);
        }
        Ok(())
    }
}

impl fmt::Debug for InteractiveObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveObserver")
            .field("executor", &self.executor.is_some())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}
