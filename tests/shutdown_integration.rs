//! Host shutdown cleanup of processes still running

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use proclaunch_cmdline::{CommandLine, ExecutableFinder};
use proclaunch_process::process_tree::is_alive;
use proclaunch_process::{ProcessLauncher, ShutdownRegistry};

#[tokio::test]
async fn guard_kills_trees_left_running() {
    let registry = Arc::new(ShutdownRegistry::new());
    let cmd = CommandLine::resolve("sh", ["-c", "sleep 30 & sleep 30 & wait"], &ExecutableFinder::new())
        .unwrap();
    let launcher = ProcessLauncher::new(cmd).with_registry(Arc::clone(&registry));

    let first = launcher.start().await.unwrap();
    let second = launcher.start().await.unwrap();
    assert_eq!(registry.len(), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut descendants = Vec::new();
    while Instant::now() < deadline {
        descendants = [first.descendant_pids(), second.descendant_pids()].concat();
        if descendants.len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(descendants.len() >= 4, "descendants: {descendants:?}");

    {
        let _guard = registry.guard();
    }
    assert!(registry.is_empty());

    assert!(first.wait_for_end_timeout(Duration::from_secs(5)).await);
    assert!(second.wait_for_end_timeout(Duration::from_secs(5)).await);
    for pid in descendants {
        assert!(!is_alive(pid), "descendant {pid} survived");
    }
}

#[tokio::test]
async fn finished_processes_leave_the_registry() {
    let registry = Arc::new(ShutdownRegistry::new());
    let cmd = CommandLine::resolve("sh", ["-c", "exit 0"], &ExecutableFinder::new()).unwrap();
    let lifecycle = ProcessLauncher::new(cmd)
        .with_registry(Arc::clone(&registry))
        .start()
        .await
        .unwrap();

    lifecycle.wait_for_end().await;
    assert!(registry.is_empty());
    assert_eq!(registry.run_cleanup(), 0);
}

#[test]
fn global_registry_kills_tree_when_main_returns() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_proclaunch-leave-running"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "host failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| line.trim().parse().unwrap())
        .collect();
    assert!(pids.len() >= 3, "pids: {pids:?}");

    // the host is gone; its tree must be gone with it
    let deadline = Instant::now() + Duration::from_secs(2);
    while pids.iter().any(|pid| is_alive(*pid)) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    for pid in pids {
        assert!(!is_alive(pid), "process {pid} outlived its host");
    }
}
