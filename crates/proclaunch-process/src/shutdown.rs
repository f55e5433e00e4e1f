//! Host shutdown cleanup of live process trees
//!
//! Every started process registers here and deregisters when its exit is
//! recorded. Whatever is still registered when the host goes down gets its
//! tree killed.
//!
//! The [global](ShutdownRegistry::global) registry arms itself on its first
//! registration: an exit-time hook (`atexit`, run when `main` returns or on
//! `std::process::exit`) and a ctrl-c/SIGTERM handler. If the host already
//! installed its own ctrl-c handler, only the exit-time hook is armed. Private
//! registries arm nothing; use [`ShutdownGuard`] or
//! [`ShutdownRegistry::install_signal_handler`] with them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::process_tree::kill_tree_blocking;
use crate::settings::KillPolicy;

/// Exit code used after a ctrl-c/SIGTERM cleanup
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupId(u64);

#[derive(Debug, Clone)]
struct Registered {
    pid: u32,
    label: String,
}

/// Registry of process trees to kill on host shutdown
#[derive(Debug)]
pub struct ShutdownRegistry {
    entries: Mutex<HashMap<CleanupId, Registered>>,
    next_id: AtomicU64,
    kill_policy: KillPolicy,
    arm_host_hooks: bool,
    hooks: Once,
}

static GLOBAL: OnceLock<Arc<ShutdownRegistry>> = OnceLock::new();

#[cfg(unix)]
extern "C" fn cleanup_at_exit() {
    if let Some(registry) = GLOBAL.get() {
        // Unwinding out of an `extern "C"` fn aborts
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| registry.run_cleanup()));
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::with_kill_policy(KillPolicy::default())
    }

    pub fn with_kill_policy(kill_policy: KillPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            kill_policy,
            arm_host_hooks: false,
            hooks: Once::new(),
        }
    }

    /// Process-wide default registry, cleaned up when the host exits
    pub fn global() -> Arc<ShutdownRegistry> {
        GLOBAL
            .get_or_init(|| {
                Arc::new(ShutdownRegistry {
                    arm_host_hooks: true,
                    ..ShutdownRegistry::new()
                })
            })
            .clone()
    }

    /// True once the exit-time hooks of this registry are installed
    pub fn host_hooks_armed(&self) -> bool {
        self.arm_host_hooks && self.hooks.is_completed()
    }

    pub fn register(&self, pid: u32, label: impl Into<String>) -> CleanupId {
        if self.arm_host_hooks {
            self.hooks.call_once(arm_host_hooks);
        }
        let id = CleanupId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        debug!(pid, label = %label, "Registered for shutdown cleanup");
        self.entries.lock().insert(id, Registered { pid, label });
        id
    }

    /// Returns false if `id` was not registered
    pub fn deregister(&self, id: CleanupId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn is_registered(&self, id: CleanupId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// PIDs currently registered
    pub fn pids(&self) -> Vec<u32> {
        self.entries.lock().values().map(|e| e.pid).collect()
    }

    /// Kill every registered tree, synchronously; returns how many were handled
    pub fn run_cleanup(&self) -> usize {
        let drained: Vec<Registered> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };

        if drained.is_empty() {
            return 0;
        }

        info!(count = drained.len(), "Killing processes left at shutdown");
        for entry in &drained {
            if let Err(e) = kill_tree_blocking(entry.pid, &self.kill_policy) {
                warn!(pid = entry.pid, label = %entry.label, error = %e, "Shutdown cleanup failed");
            }
        }
        drained.len()
    }

    /// Run the cleanup on ctrl-c/SIGTERM, then exit with code 130
    ///
    /// Only one handler can be installed per process.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let registry = Arc::clone(self);
        ctrlc::set_handler(move || {
            registry.run_cleanup();
            std::process::exit(INTERRUPTED_EXIT_CODE);
        })?;
        debug!("Shutdown signal handler installed");
        Ok(())
    }

    /// Guard running the cleanup when dropped
    pub fn guard(self: &Arc<Self>) -> ShutdownGuard {
        ShutdownGuard {
            registry: Arc::clone(self),
        }
    }
}

fn arm_host_hooks() {
    #[cfg(unix)]
    {
        // SAFETY: registers a plain `extern "C" fn` without captured state
        if unsafe { nix::libc::atexit(cleanup_at_exit) } != 0 {
            warn!("Can't register the exit-time process cleanup");
        }
    }
    #[cfg(not(unix))]
    debug!("No exit-time process cleanup on this platform, relying on the signal handler");

    let handler = ctrlc::set_handler(|| {
        if let Some(registry) = GLOBAL.get() {
            registry.run_cleanup();
        }
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });
    match handler {
        Ok(()) => debug!("Shutdown signal handler installed"),
        Err(e) => debug!(error = %e, "Host owns the ctrl-c handler, exit-time cleanup only"),
    }
}

/// Runs [`ShutdownRegistry::run_cleanup`] on drop
#[derive(Debug)]
#[must_use = "the cleanup runs when the guard is dropped"]
pub struct ShutdownGuard {
    registry: Arc<ShutdownRegistry>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.registry.run_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deregister() {
        let registry = ShutdownRegistry::new();
        let a = registry.register(11, "a");
        let b = registry.register(12, "b");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.is_registered(a));

        assert!(registry.deregister(a));
        assert!(!registry.deregister(a));
        assert!(!registry.is_registered(a));
        assert_eq!(registry.pids(), vec![12]);
    }

    #[test]
    fn test_global_is_shared() {
        let first = ShutdownRegistry::global();
        let second = ShutdownRegistry::global();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_only_global_arms_host_hooks() {
        let private = ShutdownRegistry::new();
        let id = private.register(1, "private");
        assert!(!private.host_hooks_armed());
        private.deregister(id);

        let global = ShutdownRegistry::global();
        let id = global.register(u32::MAX, "global");
        assert!(global.host_hooks_armed());
        assert!(global.deregister(id));
    }

    #[cfg(unix)]
    #[test]
    fn test_guard_kills_registered_tree() {
        use crate::process_tree::is_alive;

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let registry = Arc::new(ShutdownRegistry::new());
        registry.register(pid, "sleep");
        {
            let _guard = registry.guard();
        }

        assert!(registry.is_empty());
        child.wait().unwrap();
        assert!(!is_alive(pid));
        assert_eq!(registry.run_cleanup(), 0);
    }
}
