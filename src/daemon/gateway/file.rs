use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use fs4::tokio::AsyncFileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, instrument, warn};

use crate::utils::time::date_to_record_name;

use super::{
    presence_write_allowed, DailyWork, EmployeeId, PersistenceGateway, PresenceStatus, WindowUsage,
};

const EMPLOYEES_FILE: &str = "employees.json";
const PRESENCE_FILE: &str = "presence.json";
const DAILY_WORK_DIR: &str = "daily_work";
const WINDOW_USAGE_DIR: &str = "window_usage";

/// Row of a window usage file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WindowUsageRow {
    employee_id: EmployeeId,
    window_title: String,
    #[serde(default)]
    process_name: Option<String>,
    seconds: u64,
}

/// [PersistenceGateway] backed by JSON documents in a (usually shared) directory.
///
/// Every call opens the document it needs, locks it, and closes it before returning, so several
/// agents can point to the same directory.
///  - `employees.json` maps login names to employee ids. The agent never writes it.
///  - `presence.json` maps employee ids to their presence.
///  - `daily_work/<date>.json` maps employee ids to work and idle seconds of a local day.
///  - `window_usage/<date>.json` lists usage rows of a UTC day.
pub struct FileGateway {
    root: PathBuf,
}

impl FileGateway {
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(root.join(DAILY_WORK_DIR))?;
        std::fs::create_dir_all(root.join(WINDOW_USAGE_DIR))?;

        Ok(Self { root })
    }

    fn daily_work_path(&self, day: NaiveDate) -> PathBuf {
        self.root.join(DAILY_WORK_DIR).join(date_to_record_name(day))
    }

    fn window_usage_path(&self, day: NaiveDate) -> PathBuf {
        self.root
            .join(WINDOW_USAGE_DIR)
            .join(date_to_record_name(day))
    }

    /// Presence currently stored for an employee.
    pub async fn presence(&self, employee: EmployeeId) -> Result<Option<PresenceStatus>> {
        let presence: BTreeMap<EmployeeId, PresenceStatus> =
            read_document(&self.root.join(PRESENCE_FILE)).await?;
        Ok(presence.get(&employee).copied())
    }

    /// Seconds stored for a window on a day, summed over the employee's rows.
    #[cfg(test)]
    pub async fn window_seconds(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
        window_title: &str,
        process_name: Option<&str>,
    ) -> Result<u64> {
        let rows: Vec<WindowUsageRow> = read_document(&self.window_usage_path(day)).await?;
        Ok(rows
            .iter()
            .filter(|row| {
                row.employee_id == employee
                    && row.window_title == window_title
                    && row.process_name.as_deref() == process_name
            })
            .map(|row| row.seconds)
            .sum())
    }
}

#[async_trait]
impl PersistenceGateway for FileGateway {
    #[instrument(skip(self))]
    async fn find_employee(&self, username: &str) -> Result<Option<EmployeeId>> {
        let employees: BTreeMap<String, EmployeeId> =
            read_document(&self.root.join(EMPLOYEES_FILE)).await?;
        Ok(employees
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(username.trim()))
            .map(|(_, id)| *id))
    }

    #[instrument(skip(self))]
    async fn get_daily_work(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<DailyWork>> {
        let records: BTreeMap<EmployeeId, DailyWork> =
            read_document(&self.daily_work_path(day)).await?;
        Ok(records.get(&employee).copied())
    }

    #[instrument(skip(self))]
    async fn upsert_daily_work(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
        work: DailyWork,
    ) -> Result<()> {
        update_document(
            &self.daily_work_path(day),
            |records: &mut BTreeMap<EmployeeId, DailyWork>| {
                records.insert(employee, work);
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn upsert_window_usage(&self, usage: &WindowUsage) -> Result<()> {
        update_document(
            &self.window_usage_path(usage.day),
            |rows: &mut Vec<WindowUsageRow>| {
                let existing = rows.iter_mut().find(|row| {
                    row.employee_id == usage.employee
                        && row.window_title == usage.window_title
                        && row.process_name == usage.process_name
                });
                match existing {
                    Some(row) => row.seconds = row.seconds.saturating_add(usage.seconds),
                    None => rows.push(WindowUsageRow {
                        employee_id: usage.employee,
                        window_title: usage.window_title.clone(),
                        process_name: usage.process_name.clone(),
                        seconds: usage.seconds,
                    }),
                }
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn set_presence(
        &self,
        employee: EmployeeId,
        status: PresenceStatus,
        force: bool,
    ) -> Result<()> {
        if !presence_write_allowed(status, force) {
            warn!("Refusing to store {status} for {employee} without force");
            return Ok(());
        }
        update_document(
            &self.root.join(PRESENCE_FILE),
            |presence: &mut BTreeMap<EmployeeId, PresenceStatus>| {
                presence.insert(employee, status);
            },
        )
        .await
    }

    async fn ping(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) => Ok(metadata.is_dir() && !metadata.permissions().readonly()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads a whole document under a shared lock. Missing or empty documents are treated as default.
async fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {path:?}")),
    };
    file.lock_shared()?;
    let mut content = String::new();
    let read = file.read_to_string(&mut content).await;
    file.unlock_async().await?;
    read.with_context(|| format!("Failed to read {path:?}"))?;
    parse_document(&content, path)
}

fn parse_document<T: DeserializeOwned + Default>(content: &str, path: &Path) -> Result<T> {
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(content).with_context(|| format!("Corrupted document {path:?}"))
}

/// Read-modify-write of a document under an exclusive lock.
async fn update_document<T, R>(path: &Path, update: impl FnOnce(&mut T) -> R) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
{
    let mut file = File::options()
        .write(true)
        .create(true)
        .read(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {path:?}"))?;

    // Semi-safe acquire-release for a file
    file.lock_exclusive()?;
    let result = update_with_file(&mut file, path, update).await;
    file.unlock_async().await?;
    result
}

async fn update_with_file<T, R>(
    file: &mut File,
    path: &Path,
    update: impl FnOnce(&mut T) -> R,
) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
{
    let mut content = String::new();
    file.read_to_string(&mut content).await?;
    let mut document: T = parse_document(&content, path)?;

    let result = update(&mut document);

    let buffer = serde_json::to_vec_pretty(&document)?;
    file.rewind().await?;
    file.set_len(0).await?;
    file.write_all(&buffer).await?;
    file.flush().await?;
    file.sync_data().await?;
    debug!("Updated {path:?}");
    Ok(result)
}
