use std::sync::Arc;

use anyhow::Result;
use calsync_core::remote::Credential;
use calsync_core::remote::provider::SubprocessProvider;
use calsync_core::{Config, SyncCoordinator, SyncRequest};
use owo_colors::OwoColorize;

use super::open_store;
use crate::render::Render;
use crate::utils::tui::create_spinner;

pub struct SyncArgs {
    pub user: String,
    pub calendar: Option<String>,
    pub all: bool,
    pub force: bool,
    pub credential: Option<String>,
}

pub async fn run(config: &Config, args: SyncArgs) -> Result<()> {
    let store = open_store(config).await?;
    let provider = Arc::new(SubprocessProvider::new(
        &config.provider,
        config.provider_timeout(),
    ));
    let coordinator = SyncCoordinator::new(
        provider,
        store.clone(),
        store.clone(),
        store,
        config.sync.clone(),
    );

    let target = match (&args.calendar, args.all) {
        (_, true) => "all calendars".to_string(),
        (Some(calendar), false) => calendar.clone(),
        (None, false) => "primary".to_string(),
    };
    let request = SyncRequest {
        user_id: args.user,
        credential: args.credential.map(Credential::new),
        calendar_id: args.calendar,
        force: args.force,
        include_all_calendars: args.all,
    };

    let spinner = create_spinner(format!("Syncing {} for {}", target, request.user_id));
    let result = coordinator.sync_calendar(&request).await;
    spinner.finish_and_clear();

    match result {
        Ok(summary) => {
            println!("{}", summary.render());
            Ok(())
        }
        Err(e) => {
            if let Some(failure) = e.failure()
                && failure.retryable
            {
                println!("{}", "This failure is retryable; try again shortly.".dimmed());
            }
            Err(e.into())
        }
    }
}
