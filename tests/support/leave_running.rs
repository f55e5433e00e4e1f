//! Starts a process tree on the global registry and returns from `main`
//! while it still runs. Prints the root pid, then one descendant pid per line.

use std::time::{Duration, Instant};

use proclaunch_cmdline::{CommandLine, ExecutableFinder};
use proclaunch_process::ProcessLauncher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cmd = CommandLine::resolve(
        "sh",
        ["-c", "sleep 300 & sleep 300 & wait"],
        &ExecutableFinder::new(),
    )?;
    let lifecycle = ProcessLauncher::new(cmd).start().await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut descendants = lifecycle.descendant_pids();
    while descendants.len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        descendants = lifecycle.descendant_pids();
    }

    println!("{}", lifecycle.pid());
    for pid in descendants {
        println!("{pid}");
    }
    Ok(())
}
