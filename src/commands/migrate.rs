use anyhow::{Context, Result};
use calsync_core::Config;
use owo_colors::OwoColorize;

use super::open_store;

pub async fn run(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    store.migrate().await.context("Could not apply the schema")?;

    println!("{} Sync tables are up to date", "✓".green());
    Ok(())
}
