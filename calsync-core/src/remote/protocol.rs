//! Defines the JSON protocol used between the coordinator and provider binaries
//! over stdin/stdout.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::remote::{FetchedEvents, ProviderCalendar, ProviderError};

pub trait ProviderCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    ListCalendars,
    FetchEvents,
}

/// Request sent from the coordinator to a provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response sent from a provider to the coordinator.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success { data: T },
    Error { error: ProviderError },
}

/// List all calendars visible to the account.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListCalendars {
    pub credential: String,
}

impl ProviderCommand for ListCalendars {
    type Response = Vec<ProviderCalendar>;
    fn command() -> Command {
        Command::ListCalendars
    }
}

/// Fetch events, incrementally when a sync token is given.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchEvents {
    pub credential: String,
    pub calendar_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl ProviderCommand for FetchEvents {
    type Response = FetchedEvents;
    fn command() -> Command {
        Command::FetchEvents
    }
}
