use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, instrument, warn};

use crate::{
    daemon::{
        connectivity::{ConnectivityHandle, LogCooldown},
        gateway::{EmployeeId, PersistenceGateway, WindowUsage},
    },
    utils::clock::Clock,
};

use super::{module::EventProcessor, UsageCommand};

/// Identifies seconds waiting in the offline buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingKey {
    pub employee: EmployeeId,
    pub day: NaiveDate,
    pub window_title: String,
    pub process_name: Option<String>,
}

impl PendingKey {
    fn of(usage: &WindowUsage) -> Self {
        Self {
            employee: usage.employee,
            day: usage.day,
            window_title: usage.window_title.clone(),
            process_name: usage.process_name.clone(),
        }
    }

    fn usage(&self, seconds: u64) -> WindowUsage {
        WindowUsage {
            employee: self.employee,
            day: self.day,
            window_title: self.window_title.clone(),
            process_name: self.process_name.clone(),
            seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing worth storing.
    Ignored,
    Stored,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub stored: usize,
    pub remaining: usize,
}

/// Stores window usage additively and keeps whatever couldn't be stored in memory until the
/// store is reachable again. The buffer is owned by this writer alone and is lost when the
/// process exits.
pub struct UsageWriter {
    gateway: Arc<dyn PersistenceGateway>,
    connectivity: ConnectivityHandle,
    clock: Arc<dyn Clock>,
    pending: HashMap<PendingKey, u64>,
    offline_log: LogCooldown,
}

impl UsageWriter {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        connectivity: ConnectivityHandle,
        clock: Arc<dyn Clock>,
        offline_log_cooldown: Duration,
    ) -> Self {
        Self {
            gateway,
            connectivity,
            clock,
            pending: HashMap::new(),
            offline_log: LogCooldown::new(offline_log_cooldown),
        }
    }

    pub fn pending(&self) -> &HashMap<PendingKey, u64> {
        &self.pending
    }

    fn buffer(&mut self, usage: &WindowUsage) {
        *self.pending.entry(PendingKey::of(usage)).or_default() += usage.seconds;
    }

    #[instrument(skip(self))]
    pub async fn flush(&mut self, usage: WindowUsage) -> FlushOutcome {
        if usage.seconds == 0 || usage.window_title.is_empty() {
            return FlushOutcome::Ignored;
        }

        if !self.connectivity.is_online() {
            self.offline_log.warn(
                self.clock.instant(),
                "Offline, buffering window usage until the connection returns",
            );
            self.buffer(&usage);
            return FlushOutcome::Buffered;
        }

        match self.gateway.upsert_window_usage(&usage).await {
            Ok(()) => FlushOutcome::Stored,
            Err(e) => {
                warn!("Failed to store window usage, buffering: {e:?}");
                self.buffer(&usage);
                self.connectivity.force_check();
                FlushOutcome::Buffered
            }
        }
    }

    /// Retries buffered entries one by one. Entries are only removed after the store accepted
    /// them; failed ones stay untouched for the next drain.
    pub async fn drain(&mut self) -> DrainReport {
        if self.pending.is_empty() {
            return DrainReport::default();
        }
        if !self.connectivity.is_online() {
            debug!("Still offline, {} buffered entries wait", self.pending.len());
            return DrainReport {
                stored: 0,
                remaining: self.pending.len(),
            };
        }

        let snapshot: Vec<(PendingKey, u64)> = self
            .pending
            .iter()
            .map(|(key, seconds)| (key.clone(), *seconds))
            .collect();

        let mut stored = 0;
        for (key, seconds) in snapshot {
            match self.gateway.upsert_window_usage(&key.usage(seconds)).await {
                Ok(()) => {
                    stored += 1;
                    if let Some(left) = self.pending.get_mut(&key) {
                        *left = left.saturating_sub(seconds);
                        if *left == 0 {
                            self.pending.remove(&key);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to store buffered usage of {:?}: {e:?}", key.window_title);
                }
            }
        }

        let report = DrainReport {
            stored,
            remaining: self.pending.len(),
        };
        info!(?report, "Drained buffered window usage");
        report
    }
}

impl EventProcessor for UsageWriter {
    async fn process_next(&mut self, message: UsageCommand) -> Result<()> {
        match message {
            UsageCommand::Flush(usage) => {
                self.flush(usage).await;
            }
            UsageCommand::DrainPending => {
                self.drain().await;
            }
            UsageCommand::Barrier(done) => {
                // The other side might have stopped waiting.
                let _ = done.send(());
            }
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.drain().await;
        if !self.pending.is_empty() {
            let seconds: u64 = self.pending.values().sum();
            warn!(
                "Dropping {seconds} buffered seconds of window usage in {} entries",
                self.pending.len()
            );
        }
        Ok(())
    }
}
