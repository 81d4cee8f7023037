use anyhow::{anyhow, bail, Result};
use chrono::{Duration, Local};

use crate::daemon::{
    config::AgentConfig,
    gateway::{file::FileGateway, DailyWork, PersistenceGateway},
};

/// Prints today's totals of a user as they are in the store.
pub async fn process_status_command(user: &str, config: &AgentConfig) -> Result<()> {
    let gateway = FileGateway::new(config.store_dir.clone())?;
    if !gateway.ping().await? {
        bail!("Store at {:?} is not reachable", config.store_dir);
    }
    let employee = gateway
        .find_employee(user)
        .await?
        .ok_or_else(|| anyhow!("Unknown user {user}"))?;

    let today = Local::now().date_naive();
    let work = gateway
        .get_daily_work(employee, today)
        .await?
        .unwrap_or_default();
    let presence = gateway
        .presence(employee)
        .await?
        .map_or_else(|| "unknown".to_string(), |v| v.to_string());

    println!("{user} ({employee}) on {today}");
    println!("{}", format_daily_work(work));
    println!("Presence: {presence}");
    Ok(())
}

fn format_daily_work(work: DailyWork) -> String {
    format!(
        "Work: {}\nIdle: {}",
        format_duration(Duration::seconds(work.work_seconds as i64)),
        format_duration(Duration::seconds(work.idle_seconds as i64))
    )
}

fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}
