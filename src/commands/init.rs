use std::path::Path;

use anyhow::Result;
use calsync_core::Config;
use owo_colors::OwoColorize;

pub fn run(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    Config::create_default_config(path)?;
    println!("{} Created {}", "✓".green(), path.display());
    println!("Set database_url, then run `calsync migrate`.");
    Ok(())
}
