//! Work and idle time of the logged in employee for the current local day.
//!
//! The tick runs once a second and only touches memory. Saves run on spawned tasks, at most one
//! at a time, and work on a snapshot of the counters taken under the lock. When a save finishes
//! the snapshot is reconciled with whatever the ticks added in the meantime.
//!
//! Counters are only written as absolute values once they are known to contain the stored
//! value. Until then (boot without the store, a new day, a disconnect) the record is "pending
//! merge", and the next save adds the local growth since the baseline to the stored value instead
//! of overwriting it. A failed absolute write is retried as the same absolute write, since the
//! store may have kept it.
//!
//! Presence writes are chained, so they land in the order the ticks decided them, and `stop`
//! waits for the last one.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::NaiveDate;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    daemon::{
        config::{AgentConfig, WorkWindow},
        connectivity::{ConnectivityHandle, LogCooldown},
        gateway::{DailyWork, EmployeeId, PersistenceGateway, PresenceStatus},
        session::PresenceGate,
    },
    utils::clock::Clock,
    window_api::WindowManager,
};

use super::{elapsed::ElapsedSeconds, idle::IdleEvaluator};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const SAVE_WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct WorkTimeSettings {
    pub work_window: WorkWindow,
    pub idle: IdleEvaluator,
    /// Accounted seconds between two saves.
    pub save_every: u64,
    pub offline_log_cooldown: Duration,
}

impl From<&AgentConfig> for WorkTimeSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            work_window: config.work_window,
            idle: IdleEvaluator::new(config.idle_threshold()),
            save_every: config.save_every_seconds,
            offline_log_cooldown: config.connectivity.log_cooldown(),
        }
    }
}

/// Counters of one employee for one day, together with the stored value they grew from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayTally {
    pub employee: EmployeeId,
    pub day: NaiveDate,
    pub counters: DailyWork,
    /// Last value known to be in the store.
    pub baseline: DailyWork,
    pub pending_merge: bool,
}

impl DayTally {
    /// Tally of a day nothing is known about yet. Its first save acts as a load.
    fn unknown(employee: EmployeeId, day: NaiveDate) -> Self {
        Self {
            employee,
            day,
            counters: DailyWork::default(),
            baseline: DailyWork::default(),
            pending_merge: true,
        }
    }

    fn same_record(&self, other: &DayTally) -> bool {
        self.employee == other.employee && self.day == other.day
    }

    /// Applies a successful write of `written` made from the `saved` snapshot. Seconds counted
    /// after the snapshot was taken are kept on top. Returns true if such seconds exist.
    fn settle(&mut self, saved: &DayTally, written: DailyWork) -> bool {
        let extra = self.counters.delta_since(saved.counters);
        self.counters = written.plus(extra);
        self.baseline = written;
        self.pending_merge = false;
        !extra.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save was in flight.
    Skipped,
    Offline,
    Failed,
    NothingToSave,
}

#[derive(Debug, Default)]
struct WorkState {
    current: Option<DayTally>,
    /// Previous days (or previous sessions) not stored yet, oldest first.
    unsaved_days: Vec<DayTally>,
    dirty: bool,
    since_save: u64,
    idle: bool,
    presence: Option<PresenceStatus>,
}

impl WorkState {
    fn settle(&mut self, saved: &DayTally, written: DailyWork) {
        if let Some(current) = self.current.as_mut().filter(|c| c.same_record(saved)) {
            self.dirty = current.settle(saved, written);
        } else if let Some(tally) = self.unsaved_days.iter_mut().find(|t| t.same_record(saved)) {
            tally.settle(saved, written);
        }
    }
}

/// Copy of the accountant's state for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSnapshot {
    pub current: Option<DayTally>,
    pub unsaved_days: Vec<DayTally>,
    pub dirty: bool,
}

/// Background work dispatched by a tick.
#[derive(Default)]
pub struct TickReport {
    pub elapsed: u64,
    pub save: Option<JoinHandle<SaveOutcome>>,
    /// Presence status handed to the gate.
    pub presence: Option<PresenceStatus>,
}

struct WorkShared {
    gateway: Arc<dyn PersistenceGateway>,
    presence: Arc<PresenceGate>,
    /// Last dispatched presence write. Each write waits for the one before it.
    presence_write: Mutex<Option<JoinHandle<()>>>,
    connectivity: ConnectivityHandle,
    clock: Arc<dyn Clock>,
    settings: WorkTimeSettings,
    state: Mutex<WorkState>,
    saving: AtomicBool,
    offline_log: LogCooldown,
}

/// Releases the single-flight flag when dropped.
struct SaveGuard<'a>(&'a AtomicBool);

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WorkShared {
    fn try_begin_save(&self) -> Option<SaveGuard<'_>> {
        self.saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SaveGuard(&self.saving))
    }

    async fn begin_save_waiting(&self) -> SaveGuard<'_> {
        loop {
            if let Some(guard) = self.try_begin_save() {
                return guard;
            }
            self.clock.sleep(SAVE_WAIT_STEP).await;
        }
    }

    /// Saves unless a save is already running.
    async fn save(&self) -> SaveOutcome {
        match self.try_begin_save() {
            Some(guard) => self.save_guarded(guard).await,
            None => {
                debug!("Save already in flight, skipping");
                SaveOutcome::Skipped
            }
        }
    }

    /// Waits for a running save and saves again.
    async fn flush(&self) -> SaveOutcome {
        let guard = self.begin_save_waiting().await;
        self.save_guarded(guard).await
    }

    async fn save_guarded(&self, _guard: SaveGuard<'_>) -> SaveOutcome {
        let (unsaved, current) = {
            let mut state = self.state.lock().await;
            if state.current.is_none() && state.unsaved_days.is_empty() {
                return SaveOutcome::NothingToSave;
            }
            if !self.connectivity.is_online() {
                if let Some(current) = state.current.as_mut() {
                    current.pending_merge = true;
                }
                self.offline_log.warn(
                    self.clock.instant(),
                    "Offline, work time stays local until the connection returns",
                );
                return SaveOutcome::Offline;
            }
            (std::mem::take(&mut state.unsaved_days), state.current)
        };

        for (index, tally) in unsaved.iter().enumerate() {
            if let Err(e) = self.persist(tally).await {
                warn!("Failed to store work time of {} {}: {e:?}", tally.employee, tally.day);
                let mut state = self.state.lock().await;
                let mut remaining = unsaved[index..].to_vec();
                remaining.append(&mut state.unsaved_days);
                state.unsaved_days = remaining;
                drop(state);
                self.connectivity.force_check();
                return SaveOutcome::Failed;
            }
            info!("Stored work time of {} for {}", tally.employee, tally.day);
        }

        let Some(current) = current else {
            return SaveOutcome::Saved;
        };

        match self.persist(&current).await {
            Ok(written) => {
                self.state.lock().await.settle(&current, written);
                SaveOutcome::Saved
            }
            Err(e) => {
                warn!("Failed to store work time, retrying on next save: {e:?}");
                self.connectivity.force_check();
                SaveOutcome::Failed
            }
        }
    }

    /// The store may change while the connection is down, so the next save has to merge.
    async fn mark_disconnected(&self) {
        if let Some(current) = self.state.lock().await.current.as_mut() {
            current.pending_merge = true;
        }
    }

    /// Writes a tally and returns the value now stored.
    #[instrument(skip(self))]
    async fn persist(&self, tally: &DayTally) -> Result<DailyWork> {
        if tally.pending_merge {
            let remote = self
                .gateway
                .get_daily_work(tally.employee, tally.day)
                .await?
                .unwrap_or_default();
            let delta = tally.counters.delta_since(tally.baseline);
            let merged = remote.plus(delta);
            self.gateway
                .upsert_daily_work(tally.employee, tally.day, merged)
                .await?;
            debug!(?remote, ?delta, ?merged, "Merged work time");
            Ok(merged)
        } else {
            self.gateway
                .upsert_daily_work(tally.employee, tally.day, tally.counters)
                .await?;
            Ok(tally.counters)
        }
    }

    /// Reads the current day from the store, creating an empty record when there is none. On
    /// failure the tally stays pending merge and local counting continues.
    async fn load_current(&self) {
        let _guard = self.begin_save_waiting().await;
        let Some(tally) = self.state.lock().await.current else {
            return;
        };
        if !self.connectivity.is_online() {
            info!("Starting {} offline, counters will be merged later", tally.day);
            return;
        }

        let loaded = async {
            let stored = self.gateway.get_daily_work(tally.employee, tally.day).await?;
            match stored {
                Some(v) => Ok::<_, anyhow::Error>(v),
                None => {
                    self.gateway
                        .upsert_daily_work(tally.employee, tally.day, DailyWork::default())
                        .await?;
                    Ok(DailyWork::default())
                }
            }
        }
        .await;

        match loaded {
            Ok(stored) => {
                let mut state = self.state.lock().await;
                if let Some(current) = state.current.as_mut().filter(|c| c.same_record(&tally)) {
                    current.counters = stored.plus(current.counters.delta_since(current.baseline));
                    current.baseline = stored;
                    current.pending_merge = false;
                    info!(?stored, "Loaded work time for {}", tally.day);
                }
            }
            Err(e) => {
                warn!("Failed to load work time, counting locally: {e:?}");
                self.connectivity.force_check();
            }
        }
    }
}

pub struct WorkTimeAccountant {
    shared: Arc<WorkShared>,
    idle_source: Box<dyn WindowManager>,
    elapsed: ElapsedSeconds,
}

impl WorkTimeAccountant {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        presence: Arc<PresenceGate>,
        connectivity: ConnectivityHandle,
        clock: Arc<dyn Clock>,
        idle_source: Box<dyn WindowManager>,
        settings: WorkTimeSettings,
    ) -> Self {
        let elapsed = ElapsedSeconds::new(clock.instant());
        Self {
            shared: Arc::new(WorkShared {
                gateway,
                presence,
                presence_write: Mutex::new(None),
                connectivity,
                clock,
                offline_log: LogCooldown::new(settings.offline_log_cooldown),
                settings,
                state: Mutex::new(WorkState::default()),
                saving: AtomicBool::new(false),
            }),
            idle_source,
            elapsed,
        }
    }

    /// Begins accounting for an employee, loading today's record when the store is reachable.
    pub async fn start(&mut self, employee: EmployeeId) {
        let today = self.shared.clock.local_time().date();
        {
            let mut state = self.shared.state.lock().await;
            if let Some(previous) = state.current.take() {
                state.unsaved_days.push(previous);
            }
            state.current = Some(DayTally::unknown(employee, today));
            state.dirty = false;
            state.since_save = 0;
            state.idle = false;
            state.presence = None;
        }
        self.elapsed.reset(self.shared.clock.instant());
        self.shared.load_current().await;
    }

    /// Flushes the current day and stops accounting once the last presence write is done.
    /// Counters that couldn't be stored are kept for a later save.
    pub async fn stop(&mut self) {
        let outcome = self.shared.flush().await;
        self.wait_for_presence().await;
        let mut state = self.shared.state.lock().await;
        if let Some(current) = state.current.take() {
            if outcome != SaveOutcome::Saved && (state.dirty || current.pending_merge) {
                warn!("Work time of {} kept in memory after {outcome:?}", current.day);
                state.unsaved_days.push(current);
            }
        }
        state.dirty = false;
        state.presence = None;
    }

    /// Dispatches a save on a background task.
    pub fn request_save(&self) -> JoinHandle<SaveOutcome> {
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.save().await })
    }

    pub async fn snapshot(&self) -> WorkSnapshot {
        let state = self.shared.state.lock().await;
        WorkSnapshot {
            current: state.current,
            unsaved_days: state.unsaved_days.clone(),
            dirty: state.dirty,
        }
    }

    /// Accounts time passed since the previous tick. Never waits on the store.
    pub async fn tick(&mut self) -> TickReport {
        let elapsed = self.elapsed.advance(self.shared.clock.instant());
        let mut report = TickReport {
            elapsed,
            ..Default::default()
        };
        if elapsed == 0 {
            return report;
        }

        let now = self.shared.clock.local_time();
        let idle_reading = self
            .idle_source
            .get_idle_time()
            .inspect_err(|e| warn!("Failed to query idle time, keeping previous state {e:?}"))
            .ok();

        let settings = self.shared.settings;
        let mut state = self.shared.state.lock().await;
        let Some(mut current) = state.current else {
            return report;
        };

        let mut save_now = false;
        if current.day != now.date() {
            info!("Day changed from {} to {}", current.day, now.date());
            if !self.shared.connectivity.is_online() {
                current.pending_merge = true;
            }
            if state.dirty || current.pending_merge {
                state.unsaved_days.push(current);
            }
            current = DayTally::unknown(current.employee, now.date());
            state.dirty = false;
            state.since_save = 0;
            save_now = true;
        }

        if let Some(idle_ms) = idle_reading {
            state.idle = settings.idle.is_idle(idle_ms);
        }
        let idle = state.idle;

        if settings.work_window.contains(now.time()) {
            if idle {
                current.counters.idle_seconds += elapsed;
            } else {
                current.counters.work_seconds += elapsed;
            }
            state.dirty = true;
            state.since_save += elapsed;
        } else if !state.unsaved_days.is_empty() {
            // Previous days still need retries even when nothing is being accounted.
            state.since_save += elapsed;
        }
        state.current = Some(current);

        if state.since_save >= settings.save_every {
            state.since_save = 0;
            save_now = true;
        }

        let desired = if idle {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        };
        if state.presence != Some(desired) && self.shared.connectivity.is_online() {
            state.presence = Some(desired);
            report.presence = Some(desired);
        }
        drop(state);

        if let Some(status) = report.presence {
            self.write_presence(current.employee, status).await;
        }
        if save_now {
            report.save = Some(self.request_save());
        }
        report
    }

    async fn write_presence(&self, employee: EmployeeId, status: PresenceStatus) {
        let shared = self.shared.clone();
        let mut pending = self.shared.presence_write.lock().await;
        let previous = pending.take();
        *pending = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = shared.presence.write(employee, status).await {
                warn!("Failed to set presence {status}: {e:?}");
                let mut state = shared.state.lock().await;
                if state.presence == Some(status) {
                    state.presence = None;
                }
            }
        }));
    }

    /// Waits until every dispatched presence write finished.
    pub async fn wait_for_presence(&self) {
        let pending = self.shared.presence_write.lock().await.take();
        if let Some(pending) = pending {
            if let Err(e) = pending.await {
                warn!("Presence write did not finish: {e:?}");
            }
        }
    }

    /// Accounts for whoever is logged in until shutdown. Logging out or switching employees
    /// flushes the previous one first.
    pub async fn run(
        mut self,
        mut session: watch::Receiver<Option<EmployeeId>>,
        shutdown: CancellationToken,
    ) {
        let mut connectivity = self.shared.connectivity.subscribe();
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

            info!("Accounting work time for {employee}");
            self.start(employee).await;

            let mut next_tick = self.shared.clock.instant() + TICK_INTERVAL;
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
                            info!("Stopping work time accounting for {employee}");
                            self.stop().await;
                            if closed {
                                return;
                            }
                            break;
                        }
                    }
                    Ok(()) = connectivity.changed() => {
                        if *connectivity.borrow_and_update() {
                            debug!("Back online, merging work time");
                            self.request_save();
                        } else {
                            self.shared.mark_disconnected().await;
                        }
                    }
                    _ = self.shared.clock.sleep_until(next_tick) => {
                        // Dispatched saves finish on their own, presence writes are awaited by stop.
                        let _ = self.tick().await;
                        next_tick += TICK_INTERVAL;
                        let now = self.shared.clock.instant();
                        if next_tick < now {
                            next_tick = now + TICK_INTERVAL;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            accounting::idle::IdleEvaluator,
            config::{SessionConfig, WorkWindow},
            connectivity::{
                tests::{monitor_with, SwitchProbe},
                ConnectivityMonitor,
            },
            gateway::{memory::MemoryGateway, DailyWork, EmployeeId, PresenceStatus},
            session::{PresenceGate, SessionOrchestrator},
        },
        utils::{
            clock::{test_clock::ManualClock, DefaultClock},
            logging::TEST_LOGGING,
        },
        window_api::MockWindowManager,
    };

    use super::{SaveOutcome, WorkTimeAccountant, WorkTimeSettings};

    const EMPLOYEE: EmployeeId = EmployeeId(42);

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }
    const IDLE_MS: u32 = 60_000;

    fn settings(work_window: WorkWindow, save_every: u64) -> WorkTimeSettings {
        WorkTimeSettings {
            work_window,
            idle: IdleEvaluator::from_seconds(5),
            save_every,
            offline_log_cooldown: Duration::from_secs(30),
        }
    }

    fn all_day() -> WorkWindow {
        WorkWindow {
            start: NaiveTime::MIN,
            end: time(23, 59, 59),
        }
    }

    /// Presence gate of a session where `EMPLOYEE` stays logged in.
    fn logged_in(gateway: &Arc<MemoryGateway>) -> Arc<PresenceGate> {
        let (_, session) = watch::channel(Some(EMPLOYEE));
        Arc::new(PresenceGate::new(gateway.clone(), session))
    }

    fn idle_source(idle_ms: u32) -> MockWindowManager {
        let mut idle_source = MockWindowManager::new();
        idle_source
            .expect_get_idle_time()
            .returning(move || Ok(idle_ms));
        idle_source
    }

    struct Fixture {
        accountant: WorkTimeAccountant,
        clock: ManualClock,
        gateway: Arc<MemoryGateway>,
        probe: SwitchProbe,
        monitor: ConnectivityMonitor,
        idle_ms: Arc<AtomicU32>,
    }

    impl Fixture {
        async fn new(start: NaiveTime, online: bool) -> Self {
            Self::with_window(start, online, WorkWindow::default()).await
        }

        async fn with_window(start: NaiveTime, online: bool, work_window: WorkWindow) -> Self {
            *TEST_LOGGING;
            let clock = ManualClock::new(NaiveDateTime::new(day(), start), 0);
            let gateway = Arc::new(MemoryGateway::new());
            let probe = SwitchProbe::default();
            probe.set(online);
            let monitor = monitor_with(probe.clone());
            monitor.check().await;

            let idle_ms = Arc::new(AtomicU32::new(0));
            let mut idle_source = MockWindowManager::new();
            let reading = idle_ms.clone();
            idle_source
                .expect_get_idle_time()
                .returning(move || Ok(reading.load(Ordering::SeqCst)));

            let accountant = WorkTimeAccountant::new(
                gateway.clone(),
                logged_in(&gateway),
                monitor.handle(),
                Arc::new(clock.clone()),
                Box::new(idle_source),
                settings(work_window, 15),
            );
            Self {
                accountant,
                clock,
                gateway,
                probe,
                monitor,
                idle_ms,
            }
        }

        fn set_idle(&self, idle: bool) {
            self.idle_ms
                .store(if idle { IDLE_MS } else { 0 }, Ordering::SeqCst);
        }

        async fn set_online(&self, online: bool) {
            self.probe.set(online);
            self.monitor.check().await;
        }

        /// Advances one second at a time, waiting for everything the ticks dispatch.
        async fn run_seconds(&mut self, seconds: u64) -> Vec<SaveOutcome> {
            let mut outcomes = vec![];
            for _ in 0..seconds {
                self.clock.advance_secs(1);
                let report = self.accountant.tick().await;
                self.accountant.wait_for_presence().await;
                if let Some(save) = report.save {
                    outcomes.push(save.await.unwrap());
                }
            }
            outcomes
        }

        async fn counters(&self) -> DailyWork {
            self.accountant.snapshot().await.current.unwrap().counters
        }
    }

    fn time(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_time_outside_work_window_is_discarded() {
        let mut fixture = Fixture::new(time(6, 59, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        fixture.set_idle(true);
        fixture.run_seconds(30).await;
        fixture.set_idle(false);
        fixture.run_seconds(29).await;
        assert_eq!(fixture.counters().await, DailyWork::default());

        fixture.clock.set_local(NaiveDateTime::new(day(), time(22, 0, 0)));
        fixture.run_seconds(40).await;
        assert_eq!(fixture.counters().await, DailyWork::default());
        assert!(!fixture.accountant.snapshot().await.dirty);
    }

    #[tokio::test]
    async fn test_elapsed_goes_to_exactly_one_counter() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        fixture.set_idle(true);
        fixture.clock.advance_secs(7);
        let report = fixture.accountant.tick().await;
        assert_eq!(report.elapsed, 7);
        assert_eq!(fixture.counters().await, DailyWork::new(0, 7));

        fixture.set_idle(false);
        fixture.clock.advance(Duration::from_millis(2600));
        assert_eq!(fixture.accountant.tick().await.elapsed, 2);
        fixture.clock.advance(Duration::from_millis(500));
        assert_eq!(fixture.accountant.tick().await.elapsed, 1);
        assert_eq!(fixture.counters().await, DailyWork::new(3, 7));
    }

    #[tokio::test]
    async fn test_idle_query_failure_keeps_previous_state() {
        *TEST_LOGGING;
        let clock = ManualClock::new(NaiveDateTime::new(day(), time(9, 0, 0)), 0);
        let probe = SwitchProbe::default();
        probe.set(true);
        let monitor = monitor_with(probe);
        monitor.check().await;
        let mut idle_source = MockWindowManager::new();
        let mut readings = [Ok(IDLE_MS), Err(anyhow::anyhow!("no display"))].into_iter();
        idle_source
            .expect_get_idle_time()
            .returning(move || readings.next().unwrap_or(Ok(0)));
        let gateway = Arc::new(MemoryGateway::new());
        let mut accountant = WorkTimeAccountant::new(
            gateway.clone(),
            logged_in(&gateway),
            monitor.handle(),
            Arc::new(clock.clone()),
            Box::new(idle_source),
            settings(WorkWindow::default(), 100),
        );
        accountant.start(EMPLOYEE).await;

        for _ in 0..3 {
            clock.advance_secs(1);
            accountant.tick().await;
        }

        assert_eq!(
            accountant.snapshot().await.current.unwrap().counters,
            DailyWork::new(1, 2)
        );
    }

    #[tokio::test]
    async fn test_boot_loads_existing_record() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture
            .gateway
            .put_daily_work(EMPLOYEE, day(), DailyWork::new(100, 20));

        fixture.accountant.start(EMPLOYEE).await;

        let current = fixture.accountant.snapshot().await.current.unwrap();
        assert_eq!(current.counters, DailyWork::new(100, 20));
        assert_eq!(current.baseline, DailyWork::new(100, 20));
        assert!(!current.pending_merge);

        fixture.run_seconds(15).await;
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(115, 20))
        );
    }

    #[tokio::test]
    async fn test_boot_creates_missing_record() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::default())
        );
    }

    #[tokio::test]
    async fn test_offline_boot_merges_on_reconnect() {
        let mut fixture = Fixture::new(time(9, 0, 0), false).await;
        fixture.accountant.start(EMPLOYEE).await;
        assert!(fixture.accountant.snapshot().await.current.unwrap().pending_merge);

        let outcomes = fixture.run_seconds(20).await;
        assert_eq!(outcomes, vec![SaveOutcome::Offline]);
        assert_eq!(fixture.gateway.daily_work(EMPLOYEE, day()), None);

        // Written by the previous session before this one started.
        fixture
            .gateway
            .put_daily_work(EMPLOYEE, day(), DailyWork::new(300, 60));
        fixture.set_online(true).await;
        let outcome = fixture.accountant.request_save().await.unwrap();

        assert_eq!(outcome, SaveOutcome::Saved);
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(320, 60))
        );
        let current = fixture.accountant.snapshot().await.current.unwrap();
        assert_eq!(current.counters, DailyWork::new(320, 60));
        assert_eq!(current.baseline, DailyWork::new(320, 60));
        assert!(!current.pending_merge);
    }

    #[tokio::test]
    async fn test_merge_never_decreases_remote() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;
        fixture.run_seconds(15).await;
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(15, 0))
        );

        fixture.set_online(false).await;
        fixture.run_seconds(15).await;

        // A manual correction raised the remote value while the agent was away.
        fixture
            .gateway
            .put_daily_work(EMPLOYEE, day(), DailyWork::new(500, 40));
        fixture.set_online(true).await;
        fixture.accountant.request_save().await.unwrap();

        let stored = fixture.gateway.daily_work(EMPLOYEE, day()).unwrap();
        assert_eq!(stored, DailyWork::new(515, 40));
        assert!(stored.work_seconds >= 500);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_as_absolute_value() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        fixture.gateway.set_available(false);
        let outcomes = fixture.run_seconds(15).await;
        assert_eq!(outcomes, vec![SaveOutcome::Failed]);
        let snapshot = fixture.accountant.snapshot().await;
        let current = snapshot.current.unwrap();
        assert!(!current.pending_merge);
        assert!(snapshot.dirty);
        assert_eq!(current.counters, DailyWork::new(15, 0));

        fixture.gateway.set_available(true);
        assert_eq!(
            fixture.accountant.request_save().await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(15, 0))
        );
        assert!(!fixture.accountant.snapshot().await.dirty);
    }

    #[tokio::test]
    async fn test_write_kept_despite_error_is_not_counted_twice() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;
        fixture.run_seconds(5).await;

        fixture.gateway.lose_next_work_ack();
        assert_eq!(
            fixture.accountant.request_save().await.unwrap(),
            SaveOutcome::Failed
        );
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(5, 0))
        );

        assert_eq!(
            fixture.accountant.request_save().await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(5, 0))
        );
        assert_eq!(fixture.counters().await, DailyWork::new(5, 0));
    }

    #[tokio::test]
    async fn test_save_is_single_flight() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;
        fixture.run_seconds(5).await;
        let writes = fixture.gateway.daily_work_writes();

        let guard = fixture.accountant.shared.try_begin_save().unwrap();
        assert_eq!(
            fixture.accountant.request_save().await.unwrap(),
            SaveOutcome::Skipped
        );
        assert_eq!(fixture.gateway.daily_work_writes(), writes);
        assert!(fixture.accountant.snapshot().await.dirty);

        drop(guard);
        assert_eq!(
            fixture.accountant.request_save().await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(fixture.gateway.daily_work_writes(), writes + 1);
        assert!(!fixture.accountant.snapshot().await.dirty);
    }

    #[tokio::test]
    async fn test_day_rollover_flushes_previous_day_once() {
        let mut fixture = Fixture::with_window(time(23, 59, 40), true, all_day()).await;
        fixture
            .gateway
            .put_daily_work(EMPLOYEE, day(), DailyWork::new(1000, 0));
        fixture.accountant.start(EMPLOYEE).await;

        fixture.run_seconds(10).await;
        let writes_before = fixture.gateway.daily_work_writes();

        fixture.clock.set_local(NaiveDateTime::new(
            day().succ_opt().unwrap(),
            time(0, 0, 5),
        ));
        fixture.clock.advance_secs(1);
        let report = fixture.accountant.tick().await;
        let outcome = report.save.unwrap().await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved);

        let next_day = day().succ_opt().unwrap();
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(1010, 0))
        );
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, next_day),
            Some(DailyWork::new(1, 0))
        );
        assert_eq!(fixture.gateway.daily_work_writes(), writes_before + 2);

        let snapshot = fixture.accountant.snapshot().await;
        assert!(snapshot.unsaved_days.is_empty());
        let current = snapshot.current.unwrap();
        assert_eq!(current.day, next_day);
        assert_eq!(current.counters, DailyWork::new(1, 0));

        // Later saves only touch the new day.
        fixture.run_seconds(14).await;
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(1010, 0))
        );
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, next_day),
            Some(DailyWork::new(15, 0))
        );
    }

    #[tokio::test]
    async fn test_rollover_while_offline_is_kept_for_later() {
        let mut fixture = Fixture::with_window(time(23, 59, 0), true, all_day()).await;
        fixture.accountant.start(EMPLOYEE).await;
        fixture.run_seconds(15).await;
        fixture.set_online(false).await;
        fixture.run_seconds(5).await;

        fixture.clock.set_local(NaiveDateTime::new(
            day().succ_opt().unwrap(),
            time(0, 0, 0),
        ));
        fixture.run_seconds(3).await;
        let snapshot = fixture.accountant.snapshot().await;
        assert_eq!(snapshot.unsaved_days.len(), 1);
        assert_eq!(snapshot.unsaved_days[0].counters, DailyWork::new(20, 0));

        fixture.set_online(true).await;
        fixture.accountant.request_save().await.unwrap();
        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(20, 0))
        );
        assert_eq!(
            fixture
                .gateway
                .daily_work(EMPLOYEE, day().succ_opt().unwrap()),
            Some(DailyWork::new(3, 0))
        );
        assert!(fixture.accountant.snapshot().await.unsaved_days.is_empty());
    }

    #[tokio::test]
    async fn test_presence_is_written_on_change_only() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        fixture.run_seconds(3).await;
        fixture.set_idle(true);
        fixture.run_seconds(3).await;
        fixture.set_idle(false);
        fixture.run_seconds(1).await;

        assert_eq!(
            fixture.gateway.presence_writes(),
            vec![
                (PresenceStatus::Online, false),
                (PresenceStatus::Away, false),
                (PresenceStatus::Online, false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_after_slow_presence_write_ends_offline() {
        *TEST_LOGGING;
        let gateway = Arc::new(MemoryGateway::new().with_employee("alice", EMPLOYEE));
        gateway.delay_presence(Duration::from_millis(200));
        let probe = SwitchProbe::default();
        probe.set(true);
        let monitor = monitor_with(probe);
        monitor.check().await;
        let clock = ManualClock::new(NaiveDateTime::new(day(), time(9, 0, 0)), 0);
        let session = SessionOrchestrator::new(
            gateway.clone(),
            monitor.handle(),
            Arc::new(clock.clone()),
            SessionConfig::default(),
        );
        let mut accountant = WorkTimeAccountant::new(
            gateway.clone(),
            session.presence_gate(),
            monitor.handle(),
            Arc::new(clock.clone()),
            Box::new(idle_source(IDLE_MS)),
            settings(WorkWindow::default(), 100),
        );

        session.login("alice").await.unwrap();
        accountant.start(EMPLOYEE).await;
        clock.advance_secs(1);
        let report = accountant.tick().await;
        assert_eq!(report.presence, Some(PresenceStatus::Away));

        accountant.stop().await;
        session.logout().await;

        assert_eq!(gateway.presence(EMPLOYEE), Some(PresenceStatus::Offline));
        assert_eq!(
            gateway.presence_writes(),
            vec![
                (PresenceStatus::Online, false),
                (PresenceStatus::Away, false),
                (PresenceStatus::Offline, true)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_waits_for_running_presence_write() {
        *TEST_LOGGING;
        let gateway = Arc::new(MemoryGateway::new().with_employee("alice", EMPLOYEE));
        let probe = SwitchProbe::default();
        probe.set(true);
        let monitor = monitor_with(probe);
        monitor.check().await;
        let clock = ManualClock::new(NaiveDateTime::new(day(), time(9, 0, 0)), 0);
        let session = SessionOrchestrator::new(
            gateway.clone(),
            monitor.handle(),
            Arc::new(clock.clone()),
            SessionConfig::default(),
        );
        let mut accountant = WorkTimeAccountant::new(
            gateway.clone(),
            session.presence_gate(),
            monitor.handle(),
            Arc::new(clock.clone()),
            Box::new(idle_source(IDLE_MS)),
            settings(WorkWindow::default(), 100),
        );

        session.login("alice").await.unwrap();
        accountant.start(EMPLOYEE).await;
        gateway.delay_presence(Duration::from_millis(200));
        clock.advance_secs(1);
        accountant.tick().await;
        // Lets the Away write start before the logout.
        tokio::task::yield_now().await;
        session.logout().await;

        assert_eq!(gateway.presence(EMPLOYEE), Some(PresenceStatus::Offline));
        assert_eq!(
            gateway.presence_writes().last(),
            Some(&(PresenceStatus::Offline, true))
        );
    }

    #[tokio::test]
    async fn test_stop_flushes_current_day() {
        let mut fixture = Fixture::new(time(9, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;
        fixture.run_seconds(4).await;

        fixture.accountant.stop().await;

        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(4, 0))
        );
        let snapshot = fixture.accountant.snapshot().await;
        assert!(snapshot.current.is_none());
        assert!(snapshot.unsaved_days.is_empty());

        fixture.clock.advance_secs(3);
        assert!(fixture.accountant.tick().await.save.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_scenario() {
        let mut fixture = Fixture::new(time(8, 0, 0), true).await;
        fixture.accountant.start(EMPLOYEE).await;

        fixture.set_idle(true);
        fixture.run_seconds(20).await;
        assert_eq!(fixture.counters().await, DailyWork::new(0, 20));

        fixture.set_idle(false);
        fixture.run_seconds(10).await;
        assert_eq!(fixture.counters().await, DailyWork::new(10, 20));
        let before_disconnect = fixture.accountant.snapshot().await.current.unwrap();
        assert_eq!(before_disconnect.baseline, DailyWork::new(10, 20));

        fixture.set_online(false).await;
        fixture.run_seconds(30).await;
        assert_eq!(fixture.counters().await, DailyWork::new(40, 20));

        fixture
            .gateway
            .put_daily_work(EMPLOYEE, day(), DailyWork::new(5, 20));
        fixture.set_online(true).await;
        fixture.accountant.request_save().await.unwrap();

        assert_eq!(
            fixture.gateway.daily_work(EMPLOYEE, day()),
            Some(DailyWork::new(35, 20))
        );
        assert_eq!(fixture.counters().await, DailyWork::new(35, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_merges_after_reconnect() {
        *TEST_LOGGING;
        let gateway = Arc::new(MemoryGateway::new());
        let probe = SwitchProbe::default();
        probe.set(true);
        let monitor = monitor_with(probe.clone());
        monitor.check().await;
        let accountant = WorkTimeAccountant::new(
            gateway.clone(),
            logged_in(&gateway),
            monitor.handle(),
            Arc::new(DefaultClock),
            Box::new(idle_source(0)),
            settings(all_day(), 100),
        );
        let (_session, logged) = watch::channel(Some(EMPLOYEE));
        let today = Local::now().date_naive();
        let shutdown = CancellationToken::new();

        let ((), ()) = tokio::join!(accountant.run(logged, shutdown.clone()), async {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            probe.set(false);
            monitor.check().await;
            tokio::time::sleep(Duration::from_secs(4)).await;

            // Another workstation stored time while this one was disconnected.
            gateway.put_daily_work(EMPLOYEE, today, DailyWork::new(100, 0));
            probe.set(true);
            monitor.check().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(
                gateway.daily_work(EMPLOYEE, today),
                Some(DailyWork::new(107, 0))
            );
            shutdown.cancel();
        });

        assert_eq!(
            gateway.daily_work(EMPLOYEE, today),
            Some(DailyWork::new(107, 0))
        );
    }
}
