//! Network reachability tracking.
//!
//! [ConnectivityMonitor] probes on an interval and on request, and publishes the result through a
//! `watch` channel only when it changes. Components get a [ConnectivityHandle] at construction and
//! subscribe to it themselves.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::clock::Clock;

use super::config::ConnectivityConfig;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns true when the network is usable. Must never hang longer than its own timeout.
    async fn probe(&self) -> bool;
}

/// Probes an endpoint that answers `204 No Content`. Anything else is offline.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(config: &ConnectivityConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status() == StatusCode::NO_CONTENT,
            Err(e) => {
                debug!("Connectivity probe failed {e}");
                false
            }
        }
    }
}

/// Read side of the monitor handed to other components.
#[derive(Clone)]
pub struct ConnectivityHandle {
    state: watch::Receiver<bool>,
    force: Arc<Notify>,
}

impl ConnectivityHandle {
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that only observes transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        let mut receiver = self.state.clone();
        receiver.mark_unchanged();
        receiver
    }

    /// Asks the monitor for an immediate out-of-band probe.
    pub fn force_check(&self) {
        self.force.notify_one();
    }
}

pub struct ConnectivityMonitor {
    probe: Box<dyn ConnectivityProbe>,
    state: watch::Sender<bool>,
    force: Arc<Notify>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ConnectivityMonitor {
    /// The monitor starts offline until the first probe says otherwise.
    pub fn new(probe: Box<dyn ConnectivityProbe>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            probe,
            state,
            force: Arc::new(Notify::new()),
            interval,
            clock,
        }
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            state: self.state.subscribe(),
            force: self.force.clone(),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Runs one probe and publishes the result if it differs from the known state. Returns the
    /// observed value.
    pub async fn check(&self) -> bool {
        let online = self.probe.probe().await;
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        online
    }

    /// Executes the probing loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.check().await;
            // Forced checks restart the interval.
            let next_probe = self.clock.instant() + self.interval;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    return;
                }
                _ = self.force.notified() => {
                    debug!("Forced connectivity check");
                }
                _ = self.clock.sleep_until(next_probe) => ()
            }
        }
    }
}

/// Throttles repeated warnings. A message passes when the previous one is older than the
/// cooldown.
pub struct LogCooldown {
    cooldown: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(None),
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return true;
        };
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Warns through `tracing` if the cooldown allows it.
    pub fn warn(&self, now: Instant, message: &str) {
        if self.ready(now) {
            warn!("{message}");
        }
    }
}
