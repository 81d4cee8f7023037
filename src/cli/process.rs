use std::{env, path::Path, process::Stdio};

use anyhow::{anyhow, Result};
use sysinfo::{get_current_pid, Signal, System};
use tracing::info;

use crate::daemon::args::AgentArgs;

use super::daemon_path::to_daemon_path;

/// Terminates every other process started from the executable at `name`.
pub fn kill_previous_servers(name: &Path) -> Result<()> {
    let system = System::new_all();
    let current_id = get_current_pid().map_err(|e| anyhow!("Can't get current pid {e}"))?;
    for (pid, process) in system.processes().iter() {
        if *pid == current_id {
            continue;
        }
        if matches!(process.parent(), Some(p) if p == current_id) {
            continue;
        }

        if process
            .exe()
            .filter(|v| v.exists())
            .filter(|v| name == *v)
            .is_some()
        {
            info!("Stopping {pid}");
            // SIGTERM lets the agent flush its counters. On Windows this terminates the process
            // right away.
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
            process.wait();
        }
    }
    Ok(())
}

/// Shuts down a previous daemon and starts a new one with the same agent arguments. The daemon
/// binary detaches itself.
pub fn restart_server(agent: &AgentArgs) -> Result<()> {
    let daemon = to_daemon_path(env::current_exe()?);
    kill_previous_servers(&daemon)?;
    let mut command = std::process::Command::new(&daemon);
    command.args(agent.to_command_args());
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    println!("Spawning {daemon:?}");
    command.status()?;
    println!("Success");
    Ok(())
}
