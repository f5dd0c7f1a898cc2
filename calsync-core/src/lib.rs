//! Calendar sync coordinator.
//!
//! Keeps a local mirror of a user's provider calendars consistent with the provider:
//! - `lock` serializes syncs per calendar with session-scoped advisory locks
//! - `orchestrator` drives one calendar's attempt (sync tokens, full resync fallback, retry)
//! - `coordinator` fans a request out over its calendars and over group members
//! - `store` persists sync state, run history and the event mirror (Postgres or memory)
//! - `remote` is the provider contract and the subprocess bridge implementing it

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod normalize;
pub mod orchestrator;
pub mod remote;
pub mod resolve;
pub mod retry;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{Config, SyncSettings};
pub use coordinator::{FailedCalendar, GroupMember, SyncCoordinator, SyncRequest, SyncSummary};
pub use error::{FailureCode, SyncError, SyncFailure, SyncResult};
pub use orchestrator::CalendarSyncOutcome;
pub use store::CalendarKey;
