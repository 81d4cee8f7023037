use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;

use super::{
    presence_write_allowed, DailyWork, EmployeeId, PersistenceGateway, PresenceStatus, WindowUsage,
};

type UsageKey = (EmployeeId, NaiveDate, String, Option<String>);

/// In-memory store for tests. It can be switched off to simulate an unreachable store,
/// individual window titles can be made to fail, and presence writes can be slowed down.
#[derive(Default)]
pub struct MemoryGateway {
    unavailable: AtomicBool,
    employees: Mutex<HashMap<String, EmployeeId>>,
    daily_work: Mutex<HashMap<(EmployeeId, NaiveDate), DailyWork>>,
    usage: Mutex<HashMap<UsageKey, u64>>,
    presence: Mutex<HashMap<EmployeeId, PresenceStatus>>,
    presence_writes: Mutex<Vec<(PresenceStatus, bool)>>,
    failing_titles: Mutex<HashSet<String>>,
    lose_work_ack: AtomicBool,
    presence_delay: Mutex<Option<Duration>>,
    daily_work_writes: AtomicUsize,
    usage_writes: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_employee(self, username: &str, id: EmployeeId) -> Self {
        self.employees.lock().unwrap().insert(username.into(), id);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn fail_title(&self, title: &str) {
        self.failing_titles.lock().unwrap().insert(title.into());
    }

    pub fn heal_title(&self, title: &str) {
        self.failing_titles.lock().unwrap().remove(title);
    }

    /// The next daily work write is stored but reported as failed.
    pub fn lose_next_work_ack(&self) {
        self.lose_work_ack.store(true, Ordering::SeqCst);
    }

    /// Delays every non-forced presence write.
    pub fn delay_presence(&self, delay: Duration) {
        *self.presence_delay.lock().unwrap() = Some(delay);
    }

    pub fn daily_work(&self, employee: EmployeeId, day: NaiveDate) -> Option<DailyWork> {
        self.daily_work.lock().unwrap().get(&(employee, day)).copied()
    }

    /// Simulates another process writing the record.
    pub fn put_daily_work(&self, employee: EmployeeId, day: NaiveDate, work: DailyWork) {
        self.daily_work.lock().unwrap().insert((employee, day), work);
    }

    pub fn usage_seconds(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
        title: &str,
        process: Option<&str>,
    ) -> u64 {
        self.usage
            .lock()
            .unwrap()
            .get(&(employee, day, title.into(), process.map(Into::into)))
            .copied()
            .unwrap_or(0)
    }

    pub fn presence(&self, employee: EmployeeId) -> Option<PresenceStatus> {
        self.presence.lock().unwrap().get(&employee).copied()
    }

    pub fn presence_writes(&self) -> Vec<(PresenceStatus, bool)> {
        self.presence_writes.lock().unwrap().clone()
    }

    pub fn daily_work_writes(&self) -> usize {
        self.daily_work_writes.load(Ordering::SeqCst)
    }

    pub fn usage_writes(&self) -> usize {
        self.usage_writes.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("Store is unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn find_employee(&self, username: &str) -> Result<Option<EmployeeId>> {
        self.ensure_available()?;
        Ok(self.employees.lock().unwrap().get(username).copied())
    }

    async fn get_daily_work(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<DailyWork>> {
        self.ensure_available()?;
        Ok(self.daily_work(employee, day))
    }

    async fn upsert_daily_work(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
        work: DailyWork,
    ) -> Result<()> {
        self.ensure_available()?;
        self.daily_work_writes.fetch_add(1, Ordering::SeqCst);
        self.put_daily_work(employee, day, work);
        if self.lose_work_ack.swap(false, Ordering::SeqCst) {
            bail!("Timed out waiting for the store");
        }
        Ok(())
    }

    async fn upsert_window_usage(&self, usage: &WindowUsage) -> Result<()> {
        self.ensure_available()?;
        if self
            .failing_titles
            .lock()
            .unwrap()
            .contains(&usage.window_title)
        {
            bail!("Rejected {}", usage.window_title);
        }
        self.usage_writes.fetch_add(1, Ordering::SeqCst);
        *self
            .usage
            .lock()
            .unwrap()
            .entry((
                usage.employee,
                usage.day,
                usage.window_title.clone(),
                usage.process_name.clone(),
            ))
            .or_default() += usage.seconds;
        Ok(())
    }

    async fn set_presence(
        &self,
        employee: EmployeeId,
        status: PresenceStatus,
        force: bool,
    ) -> Result<()> {
        let delay = *self.presence_delay.lock().unwrap();
        if let Some(delay) = delay.filter(|_| !force) {
            tokio::time::sleep(delay).await;
        }
        self.ensure_available()?;
        self.presence_writes.lock().unwrap().push((status, force));
        if presence_write_allowed(status, force) {
            self.presence.lock().unwrap().insert(employee, status);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }
}
