//! Contract between the accounting engine and the central store.
//!
//! The store owns daily work records, window usage rows and presence. The agent only keeps a
//! working copy of its own counters and talks to the store through [PersistenceGateway].
//!  - Daily work is written as an absolute value (idempotent overwrite).
//!  - Window usage is written additively (upsert-add), never overwritten.
//!  - Presence can only become [PresenceStatus::Offline] when the write is forced.

pub mod file;
#[cfg(test)]
pub mod memory;

use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Longest window title the store accepts, in characters.
pub const MAX_TITLE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub i64);

impl Display for EmployeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work and idle seconds of one employee for one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DailyWork {
    pub work_seconds: u64,
    pub idle_seconds: u64,
}

impl DailyWork {
    pub fn new(work_seconds: u64, idle_seconds: u64) -> Self {
        Self {
            work_seconds,
            idle_seconds,
        }
    }

    /// Growth of each counter since `baseline`. Counters never shrink, so anything below the
    /// baseline is clamped to zero.
    pub fn delta_since(&self, baseline: DailyWork) -> DailyWork {
        DailyWork {
            work_seconds: self.work_seconds.saturating_sub(baseline.work_seconds),
            idle_seconds: self.idle_seconds.saturating_sub(baseline.idle_seconds),
        }
    }

    pub fn plus(&self, other: DailyWork) -> DailyWork {
        DailyWork {
            work_seconds: self.work_seconds.saturating_add(other.work_seconds),
            idle_seconds: self.idle_seconds.saturating_add(other.idle_seconds),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.work_seconds == 0 && self.idle_seconds == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "Online"),
            PresenceStatus::Away => write!(f, "Away"),
            PresenceStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Unknown values are treated as [PresenceStatus::Online].
impl From<&str> for PresenceStatus {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "away" => PresenceStatus::Away,
            "offline" => PresenceStatus::Offline,
            _ => PresenceStatus::Online,
        }
    }
}

impl From<String> for PresenceStatus {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

/// Offline may only be stored on an explicit logout.
pub fn presence_write_allowed(status: PresenceStatus, force: bool) -> bool {
    status != PresenceStatus::Offline || force
}

/// Seconds spent in one window, attributed to an employee and a UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUsage {
    pub employee: EmployeeId,
    pub day: NaiveDate,
    pub window_title: String,
    pub process_name: Option<String>,
    pub seconds: u64,
}

/// Trims a title and cuts it to [MAX_TITLE_CHARS] characters.
pub fn normalize_title(title: &str) -> String {
    let trimmed = title.trim();
    match trimmed.char_indices().nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => trimmed[..cut].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Empty process names carry no information and are stored as absent.
pub fn normalize_process(process: &str) -> Option<String> {
    let trimmed = process.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Remote store of counters. Implementations must be safe to call concurrently from several
/// accountants, each call being independent (no connection is held between calls).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Resolves a login name to an employee.
    async fn find_employee(&self, username: &str) -> Result<Option<EmployeeId>>;

    async fn get_daily_work(&self, employee: EmployeeId, day: NaiveDate)
        -> Result<Option<DailyWork>>;

    /// Overwrites the record for the day, creating it when absent.
    async fn upsert_daily_work(
        &self,
        employee: EmployeeId,
        day: NaiveDate,
        work: DailyWork,
    ) -> Result<()>;

    /// Adds `usage.seconds` to the stored row, creating it when absent.
    async fn upsert_window_usage(&self, usage: &WindowUsage) -> Result<()>;

    /// Writes presence. Offline without `force` is ignored.
    async fn set_presence(
        &self,
        employee: EmployeeId,
        status: PresenceStatus,
        force: bool,
    ) -> Result<()>;

    /// Checks the store itself, independently of network connectivity.
    async fn ping(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_clamped_at_zero() {
        let local = DailyWork::new(40, 3);
        let baseline = DailyWork::new(10, 5);
        assert_eq!(local.delta_since(baseline), DailyWork::new(30, 0));
    }

    #[test]
    fn unknown_presence_is_online() {
        assert_eq!(PresenceStatus::from("Busy"), PresenceStatus::Online);
        assert_eq!(PresenceStatus::from(" away "), PresenceStatus::Away);
        assert_eq!(PresenceStatus::from("OFFLINE"), PresenceStatus::Offline);
        let parsed: PresenceStatus = serde_json::from_str("\"DoNotDisturb\"").unwrap();
        assert_eq!(parsed, PresenceStatus::Online);
    }

    #[test]
    fn offline_requires_force() {
        assert!(!presence_write_allowed(PresenceStatus::Offline, false));
        assert!(presence_write_allowed(PresenceStatus::Offline, true));
        assert!(presence_write_allowed(PresenceStatus::Away, false));
    }

    #[test]
    fn titles_are_trimmed_and_cut() {
        assert_eq!(normalize_title("  Inbox - Mail  "), "Inbox - Mail");
        let long = "ж".repeat(MAX_TITLE_CHARS + 20);
        assert_eq!(normalize_title(&long).chars().count(), MAX_TITLE_CHARS);
        assert_eq!(normalize_process("   "), None);
        assert_eq!(normalize_process("code"), Some("code".into()));
    }
}
