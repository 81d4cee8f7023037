//! Agent configuration.
//!
//! Values are layered: built-in defaults, then `config.toml` in the application directory, then an
//! explicitly passed file, then `SHIFTWATCH_*` environment variables (`__` separates nested keys,
//! e.g. `SHIFTWATCH_WORK_WINDOW__START=08:00`).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use chrono::NaiveTime;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::utils::time::within_time_range;

pub const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "SHIFTWATCH_";

/// Local time of day during which activity counts towards work and idle totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        within_time_range(time, self.start, self.end)
    }
}

impl Default for WorkWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Endpoint answering `204 No Content` when the network is usable.
    pub url: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    /// Minimal pause between repeated "still offline" messages.
    pub log_cooldown_seconds: u64,
}

impl ConnectivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn log_cooldown(&self) -> Duration {
        Duration::from_secs(self.log_cooldown_seconds)
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            url: "http://clients3.google.com/generate_204".into(),
            interval_seconds: 10,
            timeout_seconds: 2,
            log_cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Log in silently with [SessionConfig::username] at start and on reconnect.
    pub remember: bool,
    pub username: Option<String>,
    pub reconnect_debounce_ms: u64,
    pub reassert_delay_seconds: u64,
}

impl SessionConfig {
    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn reassert_delay(&self) -> Duration {
        Duration::from_secs(self.reassert_delay_seconds)
    }

    /// Username to use for silent logins.
    pub fn remembered_user(&self) -> Option<&str> {
        self.username
            .as_deref()
            .filter(|_| self.remember)
            .filter(|v| !v.trim().is_empty())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            remember: false,
            username: None,
            reconnect_debounce_ms: 2000,
            reassert_delay_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory of the central store. Relative paths are resolved against the application
    /// directory.
    pub store_dir: PathBuf,
    pub work_window: WorkWindow,
    pub idle_threshold_seconds: u64,
    /// Accounted seconds between two saves of work time.
    pub save_every_seconds: u64,
    /// Accounted seconds between two periodic flushes of window usage.
    pub flush_every_seconds: u64,
    pub connectivity: ConnectivityConfig,
    pub session: SessionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("store"),
            work_window: WorkWindow::default(),
            idle_threshold_seconds: 60,
            save_every_seconds: 15,
            flush_every_seconds: 15,
            connectivity: ConnectivityConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration for an application directory, optionally from an additional file.
    pub fn load(app_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(app_dir.join(CONFIG_FILE)));

        if let Some(path) = config_path {
            if !path.exists() {
                bail!("Configuration file {path:?} doesn't exist");
            }
            figment = figment.merge(Toml::file(path));
        }

        let mut config: AgentConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        if config.store_dir.is_relative() {
            config.store_dir = app_dir.join(&config.store_dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_window.start >= self.work_window.end {
            bail!(
                "Work window must start before it ends, got {} - {}",
                self.work_window.start,
                self.work_window.end
            );
        }
        if self.save_every_seconds == 0 || self.flush_every_seconds == 0 {
            bail!("Save and flush cadences must be positive");
        }
        if self.connectivity.interval_seconds == 0 || self.connectivity.timeout_seconds == 0 {
            bail!("Connectivity interval and timeout must be positive");
        }
        Ok(())
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }
}
