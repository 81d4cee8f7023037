pub mod daemon_path;
pub mod process;
pub mod status;

use std::env;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use daemon_path::to_daemon_path;
use process::{kill_previous_servers, restart_server};
use status::process_status_command;
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::{args::AgentArgs, config::AgentConfig, start_daemon},
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX, DAEMON_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Shiftwatch", version, long_about = None)]
#[command(about = "Agent measuring work time and window usage of a signed in employee", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application, replacing a running one")]
    Init {
        #[command(flatten)]
        agent: AgentArgs,
    },
    #[command(
        about = "Run the agent directly in current console. Used for debugging and for systems where a daemon can't be created"
    )]
    Serve {
        #[command(flatten)]
        agent: AgentArgs,
    },
    #[command(about = "Stop currently running daemon.")]
    Stop {},
    #[command(about = "Show today's totals of a user as they are in the store")]
    Status {
        #[command(flatten)]
        agent: AgentArgs,
    },
}

fn load_config(agent: &AgentArgs) -> Result<AgentConfig> {
    let app_dir = agent
        .dir
        .clone()
        .map_or_else(create_application_default_path, Ok)?;
    AgentConfig::load(&std::path::absolute(app_dir)?, agent.config.as_deref())
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    let log_dir = create_application_default_path()?.join("logs");
    let prefix = match args.commands {
        Commands::Serve { .. } => DAEMON_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(prefix, &log_dir, logging_level, args.log)?;

    match args.commands {
        Commands::Init { agent } => {
            restart_server(&agent)?;
            Ok(())
        }
        Commands::Stop {} => {
            let process_name = env::current_exe()?;
            kill_previous_servers(&to_daemon_path(process_name.clone()))?;
            kill_previous_servers(&process_name)?;
            Ok(())
        }
        Commands::Serve { agent } => {
            let config = load_config(&agent)?;
            start_daemon(config, agent.user).await?;
            Ok(())
        }
        Commands::Status { agent } => {
            let user = agent
                .user
                .clone()
                .ok_or_else(|| anyhow!("Pass the user to show with --user"))?;
            let config = load_config(&agent)?;
            process_status_command(&user, &config).await
        }
    }
}
