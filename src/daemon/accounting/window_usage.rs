//! Seconds spent in each foreground window, per employee and UTC day.
//!
//! The accountant only counts. Every flush becomes a [UsageCommand] for the
//! [UsageWriter](crate::daemon::processing::usage_writer::UsageWriter), which stores it or keeps it
//! while the store is unreachable.

use std::{sync::Arc, time::Duration};

use chrono::NaiveDate;
use tokio::sync::{mpsc::UnboundedSender, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    daemon::{
        connectivity::ConnectivityHandle,
        gateway::{normalize_process, normalize_title, EmployeeId, WindowUsage},
        processing::UsageCommand,
    },
    utils::clock::Clock,
    window_api::WindowManager,
};

use super::elapsed::ElapsedSeconds;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowIdentity {
    pub title: String,
    pub process: Option<String>,
}

pub struct WindowUsageAccountant {
    next: UnboundedSender<UsageCommand>,
    producer: Box<dyn WindowManager>,
    connectivity: ConnectivityHandle,
    clock: Arc<dyn Clock>,
    /// Accounted seconds between two flushes of the same window.
    flush_every: u64,
    employee: Option<EmployeeId>,
    day: NaiveDate,
    identity: Option<WindowIdentity>,
    cur_seconds: u64,
    since_flush: u64,
    elapsed: ElapsedSeconds,
}

impl WindowUsageAccountant {
    pub fn new(
        next: UnboundedSender<UsageCommand>,
        producer: Box<dyn WindowManager>,
        connectivity: ConnectivityHandle,
        clock: Arc<dyn Clock>,
        flush_every: u64,
    ) -> Self {
        let elapsed = ElapsedSeconds::new(clock.instant());
        let day = clock.time().date_naive();
        Self {
            next,
            producer,
            connectivity,
            clock,
            flush_every,
            employee: None,
            day,
            identity: None,
            cur_seconds: 0,
            since_flush: 0,
            elapsed,
        }
    }

    pub fn identity(&self) -> Option<&WindowIdentity> {
        self.identity.as_ref()
    }

    pub fn current_seconds(&self) -> u64 {
        self.cur_seconds
    }

    fn send(&self, command: UsageCommand) {
        if let Err(e) = self.next.send(command) {
            warn!("Usage writer is gone, dropping {:?}", e.0);
        }
    }

    /// Starts counting for an employee and retries whatever an earlier session left buffered.
    pub fn start(&mut self, employee: EmployeeId) {
        self.employee = Some(employee);
        self.day = self.clock.time().date_naive();
        self.identity = None;
        self.cur_seconds = 0;
        self.since_flush = 0;
        self.elapsed.reset(self.clock.instant());
        self.send(UsageCommand::DrainPending);
    }

    /// Flushes the active window and waits until the writer handled it.
    pub async fn stop(&mut self) {
        self.flush_current();
        self.employee = None;
        self.identity = None;
        self.since_flush = 0;

        let (done, wait) = oneshot::channel();
        self.send(UsageCommand::Barrier(done));
        if wait.await.is_err() {
            warn!("Usage writer stopped before the final flush was handled");
        }
    }

    /// Hands the seconds of the active window to the writer. The identity is kept.
    fn flush_current(&mut self) {
        let seconds = std::mem::take(&mut self.cur_seconds);
        let (Some(employee), Some(identity)) = (self.employee, self.identity.as_ref()) else {
            if seconds > 0 {
                debug!("Discarding {seconds} seconds without an owner");
            }
            return;
        };
        if seconds == 0 || identity.title.is_empty() {
            return;
        }

        self.send(UsageCommand::Flush(WindowUsage {
            employee,
            day: self.day,
            window_title: identity.title.clone(),
            process_name: identity.process.clone(),
            seconds,
        }));
    }

    fn observe(&mut self) -> Option<WindowIdentity> {
        match self.producer.get_active_window_data() {
            Ok(data) => Some(WindowIdentity {
                title: normalize_title(&data.window_title),
                process: data.process_name.as_deref().and_then(normalize_process),
            }),
            Err(e) => {
                debug!("Failed to query the active window, keeping the last one {e:?}");
                self.identity.clone()
            }
        }
    }

    /// Accounts the time since the previous tick. Returns the elapsed whole seconds.
    pub fn tick(&mut self) -> u64 {
        let elapsed = self.elapsed.advance(self.clock.instant());
        if elapsed == 0 || self.employee.is_none() {
            return elapsed;
        }

        let today = self.clock.time().date_naive();
        if today != self.day {
            info!("UTC day changed from {} to {today}", self.day);
            self.flush_current();
            self.day = today;
            self.identity = None;
            self.since_flush = 0;
        }

        let observed = self.observe();
        if observed != self.identity {
            self.flush_current();
            self.identity = observed;
            self.since_flush = 0;
        }

        if self.identity.as_ref().is_some_and(|v| !v.title.is_empty()) {
            self.cur_seconds += elapsed;
            self.since_flush += elapsed;
        }

        if self.since_flush >= self.flush_every {
            self.flush_current();
            self.since_flush = 0;
        }
        elapsed
    }

    /// Counts for whoever is logged in until shutdown. The final flush of a session is handled by
    /// the writer before this returns or moves on to the next session.
    pub async fn run(
        mut self,
        mut session: watch::Receiver<Option<EmployeeId>>,
        shutdown: CancellationToken,
    ) {
        let mut connectivity = self.connectivity.subscribe();
        loop {
            let employee = loop {
                if let Some(employee) = *session.borrow_and_update() {
                    break employee;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = session.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            };

            info!("Accounting window usage for {employee}");
            self.start(employee);

            let mut next_tick = self.clock.instant() + TICK_INTERVAL;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.stop().await;
                        return;
                    }
                    changed = session.changed() => {
                        let closed = changed.is_err();
                        let logged = if closed { None } else { *session.borrow() };
                        if logged != Some(employee) {
                            info!("Stopping window usage accounting for {employee}");
                            self.stop().await;
                            if closed {
                                return;
                            }
                            break;
                        }
                    }
                    Ok(()) = connectivity.changed() => {
                        if *connectivity.borrow_and_update() {
                            debug!("Back online, draining buffered window usage");
                            self.send(UsageCommand::DrainPending);
                        }
                    }
                    _ = self.clock.sleep_until(next_tick) => {
                        self.tick();
                        next_tick += TICK_INTERVAL;
                        let now = self.clock.instant();
                        if next_tick < now {
                            next_tick = now + TICK_INTERVAL;
                        }
                    }
                }
            }
        }
    }
}
