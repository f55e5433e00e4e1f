//! Process tree inspection and termination
//!
//! Descendants are found by walking the parent links of the process table, so
//! children that moved to their own process group are still reached. Zombies
//! count as gone: they can't be killed and only wait for their parent to reap
//! them.
//!
//! Termination is always escalated the same way: graceful signal (SIGTERM,
//! `taskkill` without `/f`), wait the grace delay, forced signal (SIGKILL,
//! `taskkill /f`) to the survivors, wait again. Descendants go first, then the
//! root.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind, Users};
use tracing::{debug, error, trace, warn};

use crate::error::{ProcessError, Result};
use crate::lifecycle::ProcessLifecycle;
use crate::settings::KillPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillSignal {
    Graceful,
    Forced,
}

fn is_gone(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Live descendants of `root`, closest first
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if is_gone(process.status()) {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// True if `pid` exists and is not a zombie
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    alive_in(&mut system, pid)
}

fn alive_in(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_process(pid)
        && system
            .process(pid)
            .is_some_and(|process| !is_gone(process.status()))
}

fn alive_among(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    pids.iter()
        .copied()
        .filter(|pid| alive_in(&mut system, *pid))
        .collect()
}

/// Name of the user owning `pid`
pub fn process_user(pid: u32) -> Option<String> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_user(UpdateKind::Always));
    let uid = system.process(pid)?.user_id()?.clone();

    let users = Users::new_with_refreshed_list();
    users.get_user_by_id(&uid).map(|user| user.name().to_string())
}

/// User plus system CPU time consumed by `pid`
///
/// Read from `/proc/<pid>/stat`; zombies still report their totals. `None`
/// once the process is reaped, and on platforms without procfs.
#[cfg(target_os = "linux")]
pub fn cpu_time(pid: u32) -> Option<Duration> {
    use nix::unistd::{sysconf, SysconfVar};

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may hold spaces or parentheses
    let fields: Vec<&str> = stat.get(stat.rfind(')')? + 1..)?.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    let ticks = sysconf(SysconfVar::CLK_TCK).ok().flatten().filter(|t| *t > 0)? as u64;
    Some(Duration::from_millis((utime + stime) * 1000 / ticks))
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_time(_pid: u32) -> Option<Duration> {
    None
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: KillSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = match signal {
        KillSignal::Graceful => Signal::SIGTERM,
        KillSignal::Forced => Signal::SIGKILL,
    };
    match kill(NixPid::from_raw(pid as i32), sig) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, signal: KillSignal) -> io::Result<()> {
    use std::process::{Command, Stdio};

    let pid = pid.to_string();
    let mut args = vec!["/pid", pid.as_str()];
    if signal == KillSignal::Forced {
        args.push("/f");
    }

    // taskkill fails for processes that are already gone; liveness is checked after
    Command::new("taskkill")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(())
}

fn signal_all(pids: &[u32], signal: KillSignal) {
    for &pid in pids {
        match send_signal(pid, signal) {
            Ok(()) => trace!(pid, ?signal, "Signal sent"),
            Err(e) => warn!(pid, ?signal, error = %e, "Failed to signal process"),
        }
    }
}

async fn wait_gone(mut pids: Vec<u32>, within: Duration, step: Duration) -> Vec<u32> {
    let deadline = Instant::now() + within;
    loop {
        pids = alive_among(&pids);
        if pids.is_empty() || Instant::now() >= deadline {
            return pids;
        }
        tokio::time::sleep(step).await;
    }
}

fn wait_gone_blocking(mut pids: Vec<u32>, within: Duration, step: Duration) -> Vec<u32> {
    let deadline = Instant::now() + within;
    loop {
        pids = alive_among(&pids);
        if pids.is_empty() || Instant::now() >= deadline {
            return pids;
        }
        std::thread::sleep(step);
    }
}

async fn escalate(pids: Vec<u32>, policy: &KillPolicy) -> Vec<u32> {
    if pids.is_empty() {
        return pids;
    }
    signal_all(&pids, KillSignal::Graceful);
    let survivors = wait_gone(pids, policy.grace, policy.poll_interval).await;
    if survivors.is_empty() {
        return survivors;
    }
    debug!(pids = ?survivors, "Escalating to forced kill");
    signal_all(&survivors, KillSignal::Forced);
    wait_gone(survivors, policy.force_wait, policy.poll_interval).await
}

fn escalate_blocking(pids: Vec<u32>, policy: &KillPolicy) -> Vec<u32> {
    if pids.is_empty() {
        return pids;
    }
    signal_all(&pids, KillSignal::Graceful);
    let survivors = wait_gone_blocking(pids, policy.grace, policy.poll_interval);
    if survivors.is_empty() {
        return survivors;
    }
    debug!(pids = ?survivors, "Escalating to forced kill");
    signal_all(&survivors, KillSignal::Forced);
    wait_gone_blocking(survivors, policy.force_wait, policy.poll_interval)
}

/// Root of a supervised tree; liveness comes from its reaper, not the process table
async fn escalate_root(lifecycle: &ProcessLifecycle, policy: &KillPolicy) -> bool {
    let pid = lifecycle.pid();
    if !lifecycle.is_running() {
        return true;
    }

    signal_all(&[pid], KillSignal::Graceful);
    if tokio::time::timeout(policy.grace, lifecycle.wait_exited())
        .await
        .is_ok()
    {
        return true;
    }

    debug!(pid, "Escalating to forced kill");
    signal_all(&[pid], KillSignal::Forced);
    tokio::time::timeout(policy.force_wait, lifecycle.wait_exited())
        .await
        .is_ok()
}

fn unkillable(root: u32, pids: Vec<u32>) -> Result<()> {
    if pids.is_empty() {
        debug!(pid = root, "Process tree killed");
        return Ok(());
    }
    error!(pid = root, survivors = ?pids, "Unkillable processes");
    Err(ProcessError::Unkillable { pids })
}

/// Kill a supervised process and all its descendants
pub(crate) async fn kill_tree(lifecycle: &ProcessLifecycle, policy: &KillPolicy) -> Result<()> {
    let root = lifecycle.pid();
    let children = descendants(root);
    debug!(pid = root, descendants = ?children, "Killing process tree");

    let mut survivors = escalate(children, policy).await;
    if !escalate_root(lifecycle, policy).await {
        survivors.push(root);
    }
    unkillable(root, survivors)
}

/// Kill any process and its descendants without an async runtime
pub fn kill_tree_blocking(root: u32, policy: &KillPolicy) -> Result<()> {
    let children = descendants(root);
    debug!(pid = root, descendants = ?children, "Killing process tree");

    let mut survivors = escalate_blocking(children, policy);
    survivors.extend(escalate_blocking(alive_among(&[root]), policy));
    unkillable(root, survivors)
}
