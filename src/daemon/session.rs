//! Who is logged in on this workstation.
//!
//! The orchestrator publishes the current employee through a `watch` channel. Accountants start
//! when it becomes `Some` and flush and stop when it goes back to `None` or changes.
//!
//! Every presence write goes through the [`PresenceGate`], so the forced Offline of a logout is
//! always the last status written for that session.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::utils::clock::Clock;

use super::{
    config::SessionConfig,
    connectivity::ConnectivityHandle,
    gateway::{EmployeeId, PersistenceGateway, PresenceStatus},
};

/// Serializes presence writes and checks them against the session while holding the lock.
pub struct PresenceGate {
    gateway: Arc<dyn PersistenceGateway>,
    session: watch::Receiver<Option<EmployeeId>>,
    lock: Mutex<()>,
}

impl PresenceGate {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        session: watch::Receiver<Option<EmployeeId>>,
    ) -> Self {
        Self {
            gateway,
            session,
            lock: Mutex::new(()),
        }
    }

    /// Writes `status` unless `employee` is no longer logged in. Returns whether it was written.
    pub async fn write(&self, employee: EmployeeId, status: PresenceStatus) -> Result<bool> {
        let _lock = self.lock.lock().await;
        if *self.session.borrow() != Some(employee) {
            debug!("{employee} is not logged in, not writing {status}");
            return Ok(false);
        }
        self.gateway.set_presence(employee, status, false).await?;
        Ok(true)
    }

    /// Forced Offline, written after any write that is already running.
    async fn write_offline(&self, employee: EmployeeId) -> Result<()> {
        let _lock = self.lock.lock().await;
        self.gateway
            .set_presence(employee, PresenceStatus::Offline, true)
            .await
    }
}

pub struct SessionOrchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    connectivity: ConnectivityHandle,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    state: watch::Sender<Option<EmployeeId>>,
    presence: Arc<PresenceGate>,
}

impl SessionOrchestrator {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        connectivity: ConnectivityHandle,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let (state, session) = watch::channel(None);
        let presence = Arc::new(PresenceGate::new(gateway.clone(), session));
        Self {
            gateway,
            connectivity,
            clock,
            config,
            state,
            presence,
        }
    }

    /// Gate for presence writes made on behalf of this session.
    pub fn presence_gate(&self) -> Arc<PresenceGate> {
        self.presence.clone()
    }

    pub fn is_logged(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn employee_id(&self) -> Option<EmployeeId> {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<EmployeeId>> {
        self.state.subscribe()
    }

    /// Resolves `username` in the store and logs it in. The session stays as it was when the user
    /// can't be resolved.
    #[instrument(skip(self))]
    pub async fn login(&self, username: &str) -> Result<EmployeeId> {
        let username = username.trim();
        if username.is_empty() {
            bail!("Username is empty");
        }

        let employee = self
            .gateway
            .find_employee(username)
            .await
            .with_context(|| format!("Failed to resolve {username}"))?
            .ok_or_else(|| anyhow!("Unknown user {username}"))?;

        self.state.send_replace(Some(employee));
        info!("Logged in {username} as {employee}");

        self.assert_online(employee).await;
        self.schedule_reassert(employee);
        Ok(employee)
    }

    /// Logs in the remembered user, if there is one.
    pub async fn auto_login(&self) -> Result<Option<EmployeeId>> {
        match self.config.remembered_user() {
            Some(username) => self.login(username).await.map(Some),
            None => Ok(None),
        }
    }

    /// Ends the session. This is the only place that marks an employee offline.
    pub async fn logout(&self) {
        let Some(employee) = self.state.send_replace(None) else {
            return;
        };
        info!("Logged out {employee}");
        if let Err(e) = self.presence.write_offline(employee).await {
            warn!("Failed to mark {employee} offline: {e:?}");
        }
    }

    async fn assert_online(&self, employee: EmployeeId) {
        if let Err(e) = self.presence.write(employee, PresenceStatus::Online).await {
            warn!("Failed to mark {employee} online: {e:?}");
        }
    }

    /// Writes Online once more after a delay, overwriting whatever a previous process left behind
    /// in the meantime. Skipped when the session changed.
    fn schedule_reassert(&self, employee: EmployeeId) {
        let presence = self.presence.clone();
        let clock = self.clock.clone();
        let delay = self.config.reassert_delay();
        tokio::spawn(async move {
            clock.sleep(delay).await;
            match presence.write(employee, PresenceStatus::Online).await {
                Ok(true) => (),
                Ok(false) => debug!("Session changed, not reasserting presence of {employee}"),
                Err(e) => warn!("Failed to reassert presence of {employee}: {e:?}"),
            }
        });
    }

    async fn on_reconnect(&self) {
        match self.employee_id() {
            Some(employee) => {
                debug!("Reconnected, reasserting presence of {employee}");
                self.assert_online(employee).await;
            }
            None => {
                if let Err(e) = self.auto_login().await {
                    warn!("Automatic login failed: {e:?}");
                }
            }
        }
    }

    /// Reacts to the network coming back until shutdown. Flapping connectivity restarts the
    /// debounce, so only a stable reconnect is acted upon.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut connectivity = self.connectivity.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if !*connectivity.borrow_and_update() {
                continue;
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        connectivity.borrow_and_update();
                    }
                    _ = self.clock.sleep(self.config.reconnect_debounce()) => break,
                }
            }

            if self.connectivity.is_online() {
                self.on_reconnect().await;
            }
        }
    }
}
