use std::sync::Arc;

use accounting::{
    window_usage::WindowUsageAccountant,
    work_time::{WorkTimeAccountant, WorkTimeSettings},
};
use anyhow::Result;
use config::AgentConfig;
use connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe};
use gateway::{file::FileGateway, PersistenceGateway};
use processing::{usage_writer::UsageWriter, ProcessingModule};
use session::SessionOrchestrator;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    utils::clock::{Clock, DefaultClock},
    window_api::{GenericWindowManager, WindowManager},
};

pub mod accounting;
pub mod args;
pub mod config;
pub mod connectivity;
pub mod gateway;
pub mod processing;
pub mod session;
pub mod shutdown;

/// Every long running part of the agent, wired together.
pub struct Agent {
    monitor: ConnectivityMonitor,
    session: SessionOrchestrator,
    work_time: WorkTimeAccountant,
    window_usage: WindowUsageAccountant,
    writer: ProcessingModule<UsageWriter>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        gateway: Arc<dyn PersistenceGateway>,
        probe: Box<dyn ConnectivityProbe>,
        idle_source: Box<dyn WindowManager>,
        window_source: Box<dyn WindowManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let monitor =
            ConnectivityMonitor::new(probe, config.connectivity.interval(), clock.clone());
        let connectivity = monitor.handle();

        let session = SessionOrchestrator::new(
            gateway.clone(),
            connectivity.clone(),
            clock.clone(),
            config.session.clone(),
        );
        let work_time = WorkTimeAccountant::new(
            gateway.clone(),
            session.presence_gate(),
            connectivity.clone(),
            clock.clone(),
            idle_source,
            WorkTimeSettings::from(config),
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let window_usage = WindowUsageAccountant::new(
            sender,
            window_source,
            connectivity.clone(),
            clock.clone(),
            config.flush_every_seconds,
        );
        let writer = ProcessingModule::new(
            receiver,
            UsageWriter::new(
                gateway,
                connectivity,
                clock,
                config.connectivity.log_cooldown(),
            ),
        );

        Self {
            monitor,
            session,
            work_time,
            window_usage,
            writer,
        }
    }

    /// Runs until `shutdown` is cancelled. Both accountants flush before the employee is logged
    /// out.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Agent {
            monitor,
            session,
            work_time,
            window_usage,
            writer,
        } = self;

        if let Err(e) = session.auto_login().await {
            warn!("Automatic login failed, retrying when the network returns: {e:?}");
        }

        let logged = session.subscribe();
        let (_, _, _, _, processing_result) = tokio::join!(
            monitor.run(shutdown.clone()),
            session.run(shutdown.clone()),
            work_time.run(logged.clone(), shutdown.clone()),
            window_usage.run(logged, shutdown.clone()),
            writer.run(),
        );

        if let Err(processing_result) = &processing_result {
            error!("Usage writer got an error {:?}", processing_result);
        }

        session.logout().await;
        info!("Agent stopped");
        processing_result
    }
}

/// Represents the starting point for the daemon. `user` is logged in at start and again whenever
/// the network returns.
pub async fn start_daemon(config: AgentConfig, user: Option<String>) -> Result<()> {
    let mut config = config;
    if let Some(user) = user {
        config.session.remember = true;
        config.session.username = Some(user);
    }
    info!("Using store at {:?}", config.store_dir);

    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let gateway = Arc::new(FileGateway::new(config.store_dir.clone())?);
    let probe = HttpProbe::new(&config.connectivity)?;

    let agent = Agent::new(
        &config,
        gateway,
        Box::new(probe),
        Box::new(GenericWindowManager::new()?),
        Box::new(GenericWindowManager::new()?),
        clock,
    );

    let shutdown_token = CancellationToken::new();
    let (_, result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        agent.run(shutdown_token.clone()),
    );
    result
}
