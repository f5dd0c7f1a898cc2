//! Expands a sync request into concrete calendar targets.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{classify, missing_credential};
use crate::error::SyncResult;
use crate::remote::{CalendarProvider, Credential, PRIMARY_CALENDAR_ID, ProviderCalendar};

/// One calendar to sync during a single call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarTarget {
    pub id: String,
    pub display_name: Option<String>,
    pub is_primary: bool,
}

impl CalendarTarget {
    pub fn single(id: &str) -> Self {
        CalendarTarget {
            id: id.to_string(),
            display_name: None,
            is_primary: id == PRIMARY_CALENDAR_ID,
        }
    }

    fn primary() -> Self {
        CalendarTarget {
            id: PRIMARY_CALENDAR_ID.to_string(),
            display_name: None,
            is_primary: true,
        }
    }
}

/// Keep selected calendars, drop duplicate ids, order primary first then by name.
pub fn select_targets(calendars: Vec<ProviderCalendar>) -> Vec<CalendarTarget> {
    let mut seen = HashSet::new();
    let mut targets: Vec<CalendarTarget> = calendars
        .into_iter()
        .filter(|cal| cal.selected)
        .filter(|cal| seen.insert(cal.id.clone()))
        .map(|cal| CalendarTarget {
            id: cal.id,
            display_name: cal.display_name,
            is_primary: cal.is_primary,
        })
        .collect();

    targets.sort_by(|a, b| {
        b.is_primary
            .cmp(&a.is_primary)
            .then_with(|| sort_name(a).cmp(&sort_name(b)))
    });

    if targets.is_empty() {
        targets.push(CalendarTarget::primary());
    }
    targets
}

fn sort_name(target: &CalendarTarget) -> String {
    target
        .display_name
        .as_deref()
        .unwrap_or(&target.id)
        .to_lowercase()
}

/// Resolve the targets for one sync call.
///
/// Only `include_all` touches the provider (one listing call), so only then is a
/// credential required. A listing failure is returned already classified.
pub async fn resolve_targets(
    provider: &dyn CalendarProvider,
    credential: Option<&Credential>,
    requested: &str,
    include_all: bool,
) -> SyncResult<Vec<CalendarTarget>> {
    if !include_all {
        return Ok(vec![CalendarTarget::single(requested)]);
    }

    let credential = credential
        .filter(|c| !c.is_blank())
        .ok_or_else(missing_credential)?;
    let calendars = provider
        .list_calendars(credential)
        .await
        .map_err(|e| classify(&e))?;
    let listed = calendars.len();
    let targets = select_targets(calendars);

    debug!(listed, selected = targets.len(), "resolved calendar targets");
    Ok(targets)
}
