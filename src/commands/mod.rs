pub mod init;
pub mod migrate;
pub mod repair;
pub mod runs;
pub mod status;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use calsync_core::Config;
use calsync_core::store::postgres::PgStore;

/// Default number of runs shown by `calsync runs`.
pub const RUNS_LIMIT: usize = 10;

pub async fn open_store(config: &Config) -> Result<Arc<PgStore>> {
    let url = config.database_url()?;
    let store = PgStore::connect(url, config.database_max_connections)
        .await
        .context("Could not connect to the database")?;
    Ok(Arc::new(store))
}
