use anyhow::Result;
use calsync_core::store::{CalendarKey, StateReset, SyncStateStore};
use calsync_core::Config;
use owo_colors::OwoColorize;

use super::open_store;
use crate::render::Render;

pub struct RepairArgs {
    pub calendar: String,
    pub clear_token: bool,
    pub clear_reauth: bool,
    pub reset_failures: bool,
    pub clear_in_progress: bool,
}

impl RepairArgs {
    fn reset(&self) -> StateReset {
        let reset = StateReset {
            clear_sync_token: self.clear_token,
            clear_needs_reauth: self.clear_reauth,
            reset_failures: self.reset_failures,
            clear_in_progress: self.clear_in_progress,
        };
        if reset.is_empty() { StateReset::all() } else { reset }
    }
}

pub async fn run(config: &Config, args: RepairArgs) -> Result<()> {
    let store = open_store(config).await?;
    let key = CalendarKey::from_raw(args.calendar.as_str());

    let Some(state) = store.reset(&key, &args.reset()).await? else {
        anyhow::bail!("No sync state for calendar '{}'", key);
    };

    println!("{} Repaired {}", "✓".green(), key);
    println!("{}", state.render());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RepairArgs {
        RepairArgs {
            calendar: "u1:primary".into(),
            clear_token: false,
            clear_reauth: false,
            reset_failures: false,
            clear_in_progress: false,
        }
    }

    #[test]
    fn test_no_flag_clears_everything() {
        assert_eq!(args().reset(), StateReset::all());
    }

    #[test]
    fn test_flags_select_fields() {
        let reset = RepairArgs {
            clear_in_progress: true,
            ..args()
        }
        .reset();
        assert!(reset.clear_in_progress);
        assert!(!reset.clear_sync_token);
        assert!(!reset.clear_needs_reauth);
        assert!(!reset.reset_failures);
    }
}
