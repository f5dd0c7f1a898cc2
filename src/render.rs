//! Terminal rendering for sync state, run history and sync results.

use std::time::Duration;

use calsync_core::store::{CalendarSyncRun, CalendarSyncState, RunStatus};
use calsync_core::{CalendarSyncOutcome, FailedCalendar, SyncSummary};
use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;

/// Extension trait for TUI rendering with colors.
pub trait Render {
    fn render(&self) -> String;
}

/// "3m 12s ago", rounded to whole seconds.
fn ago(at: DateTime<Utc>) -> String {
    let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
    format!(
        "{} ago",
        humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
    )
}

fn ago_or_never(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "never".to_string(), ago)
}

fn pluralize(word: &str, count: u64) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

impl Render for CalendarSyncState {
    fn render(&self) -> String {
        let mut lines = vec![format!("📅 {}", self.calendar_id)];

        let mut flags = Vec::new();
        if self.needs_reauth {
            flags.push("NEEDS REAUTH".red().bold().to_string());
        }
        if self.in_progress {
            let since = ago_or_never(self.in_progress_started_at);
            flags.push(format!("{} (started {})", "IN PROGRESS".yellow(), since));
        }
        if !flags.is_empty() {
            lines.push(format!("   {}", flags.join("  ")));
        }

        lines.push(format!("   last synced    {}", ago_or_never(self.last_synced_at)));
        lines.push(format!("   last full sync {}", ago_or_never(self.last_full_sync_at)));
        lines.push(format!("   last attempt   {}", ago_or_never(self.last_attempted_at)));

        let token = if self.sync_token.is_some() {
            "stored".green().to_string()
        } else {
            "none (next sync is a full resync)".dimmed().to_string()
        };
        lines.push(format!("   sync token     {token}"));

        if self.consecutive_failures > 0 {
            lines.push(format!(
                "   failures       {}",
                self.consecutive_failures.to_string().red()
            ));
        }
        if let Some(error) = &self.last_error {
            let code = self.last_error_code.as_deref().unwrap_or("UNKNOWN");
            lines.push(format!("   last error     [{}] {}", code.red(), error));
        }

        lines.join("\n")
    }
}

impl Render for CalendarSyncRun {
    fn render(&self) -> String {
        let status = match self.status {
            RunStatus::Success => format!("{} {}", "✓".green(), self.status.green()),
            RunStatus::Failed => format!("{} {}", "✗".red(), self.status.red()),
            RunStatus::InProgress => format!("{} {}", "…".yellow(), self.status.yellow()),
        };

        let took = self
            .finished_at
            .and_then(|finished| (finished - self.started_at).to_std().ok())
            .map(|d| humantime::format_duration(Duration::from_millis(d.as_millis() as u64)).to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut line = format!(
            "{} {}  attempt {}  seen {} upserted {} cancelled {}  {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S").dimmed(),
            status,
            self.attempt,
            self.items_seen,
            self.items_upserted,
            self.items_cancelled,
            took.dimmed(),
        );
        if self.sync_token_in.is_none() {
            line.push_str(&format!("  {}", "full".cyan()));
        }
        if let Some(code) = &self.error_code {
            line.push_str(&format!("  {}", code.red()));
        }
        line
    }
}

impl Render for CalendarSyncOutcome {
    fn render(&self) -> String {
        if self.skipped {
            return format!("📅 {} {}", self.calendar_id, "(recently synced, skipped)".dimmed());
        }

        let mut parts = Vec::new();
        if self.inserted > 0 {
            parts.push(format!("+{} new", self.inserted).green().to_string());
        }
        if self.updated > 0 {
            parts.push(format!("~{} changed", self.updated).yellow().to_string());
        }
        if self.cancelled > 0 {
            parts.push(format!("-{} cancelled", self.cancelled).red().to_string());
        }
        if parts.is_empty() {
            parts.push("up to date".dimmed().to_string());
        }
        if self.invalid_events_skipped > 0 {
            let label = format!(
                "{} invalid {} skipped",
                self.invalid_events_skipped,
                pluralize("event", self.invalid_events_skipped)
            );
            parts.push(label.dimmed().to_string());
        }

        let mut line = format!("📅 {}  {}", self.calendar_id, parts.join(", "));
        if self.full_sync {
            line.push_str(&format!("  {}", "(full sync)".cyan()));
        }
        if self.attempts > 1 {
            line.push_str(&format!("  {}", format!("after {} attempts", self.attempts).dimmed()));
        }
        line
    }
}

impl Render for FailedCalendar {
    fn render(&self) -> String {
        let retry = if self.retryable { " (retryable)" } else { "" };
        format!(
            "📅 {}  {} {}{}",
            self.calendar_id,
            format!("[{}]", self.code).red(),
            self.message,
            retry.dimmed()
        )
    }
}

impl Render for SyncSummary {
    fn render(&self) -> String {
        let mut lines: Vec<String> = self.calendars.iter().map(Render::render).collect();
        lines.extend(self.failed_calendars.iter().map(Render::render));

        if self.skipped {
            return lines.join("\n");
        }

        lines.push(String::new());
        lines.push(format!(
            "Synced {} of {} {}: {} new, {} changed, {} cancelled ({} fetched)",
            self.calendars.len(),
            self.calendar_target_count,
            pluralize("calendar", self.calendar_target_count as u64),
            self.inserted,
            self.updated,
            self.cancelled,
            self.fetched_items,
        ));
        lines.join("\n")
    }
}
