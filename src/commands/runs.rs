use anyhow::Result;
use calsync_core::store::{CalendarKey, SyncStateStore};
use calsync_core::Config;

use super::open_store;
use crate::render::Render;

pub async fn run(config: &Config, calendar: &str, limit: usize) -> Result<()> {
    let store = open_store(config).await?;
    let key = CalendarKey::from_raw(calendar);

    let runs = store.recent_runs(&key, limit).await?;
    if runs.is_empty() {
        println!("No sync runs recorded for {}", key);
        return Ok(());
    }

    println!("📅 {}", key);
    for run in &runs {
        println!("   {}", run.render());
    }

    Ok(())
}
