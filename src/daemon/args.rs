use std::path::PathBuf;

use clap::{Args, Parser};
use tracing::level_filters::LevelFilter;

/// Where the agent keeps its files and who it runs for. Shared by the daemon and the cli.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Application directory holding logs and `config.toml`. By default tries to save into
    /// $XDG_STATE_HOME or $HOME/.local/state
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Additional configuration file, merged over the one in the application directory.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Login name to sign in with. It is remembered for reconnects.
    #[arg(long)]
    pub user: Option<String>,
}

impl AgentArgs {
    /// Arguments to hand over to a daemon started on behalf of the cli.
    pub fn to_command_args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(dir) = &self.dir {
            args.push("--dir".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.to_string_lossy().into_owned());
        }
        if let Some(user) = &self.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        args
    }
}

#[derive(Parser)]
pub struct DaemonArgs {
    #[arg(long)]
    pub force: bool,
    #[command(flatten)]
    pub agent: AgentArgs,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console")]
    pub log_console: bool,
    #[arg(long = "log-filter")]
    pub log: Option<LevelFilter>,
}
