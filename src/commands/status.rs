use anyhow::Result;
use calsync_core::store::{CalendarKey, SyncStateStore};
use calsync_core::Config;

use super::open_store;
use crate::render::Render;

pub async fn run(config: &Config, calendar: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;

    let states = match calendar {
        Some(raw) => {
            let key = CalendarKey::from_raw(raw);
            match store.get_state(&key).await? {
                Some(state) => vec![state],
                None => anyhow::bail!("No sync state for calendar '{}'", key),
            }
        }
        None => store.list_states().await?,
    };

    if states.is_empty() {
        println!("No calendars have been synced yet.");
        return Ok(());
    }

    for (i, state) in states.iter().enumerate() {
        println!("{}", state.render());

        // Add spacing between calendars (but not after the last one)
        if i < states.len() - 1 {
            println!();
        }
    }

    Ok(())
}
