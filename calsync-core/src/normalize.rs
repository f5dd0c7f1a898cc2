//! Converts provider events into the shape stored in the local mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::remote::{ProviderEvent, ProviderEventTime};

/// A non-cancelled event ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub provider_event_id: String,
    pub ical_uid: Option<String>,
    pub recurring_event_id: Option<String>,
    /// Start of the original instance, for exceptions of a recurring series.
    pub original_start_time: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
    pub status: Option<String>,
    pub provider_updated_at: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(NormalizedEvent),
    Cancelled { provider_event_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("event has no id")]
    MissingId,
    #[error("event has no usable start")]
    MissingStart,
    #[error("event has no usable end")]
    MissingEnd,
    #[error("event ends before it starts")]
    EndNotAfterStart,
}

/// Resolved instant, remembering whether it came from a whole date.
fn resolve(time: Option<&ProviderEventTime>) -> Option<(DateTime<Utc>, bool)> {
    let time = time?;
    if let Some(dt) = time.date_time {
        return Some((dt, false));
    }
    time.date
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| (naive.and_utc(), true))
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.filter(|s| !s.is_empty()).cloned()
}

pub fn normalize(
    event: &ProviderEvent,
    calendar_time_zone: Option<&str>,
) -> Result<Normalized, RejectReason> {
    if event.id.is_empty() {
        return Err(RejectReason::MissingId);
    }

    if event.is_cancelled() {
        return Ok(Normalized::Cancelled {
            provider_event_id: event.id.clone(),
        });
    }

    let (start_at, start_is_date) =
        resolve(event.start.as_ref()).ok_or(RejectReason::MissingStart)?;
    let (end_at, end_is_date) = resolve(event.end.as_ref()).ok_or(RejectReason::MissingEnd)?;

    if end_at <= start_at {
        return Err(RejectReason::EndNotAfterStart);
    }

    let time_zone = event
        .start
        .as_ref()
        .and_then(|t| non_empty(t.time_zone.as_ref()))
        .or_else(|| event.end.as_ref().and_then(|t| non_empty(t.time_zone.as_ref())))
        .or_else(|| calendar_time_zone.filter(|tz| !tz.is_empty()).map(str::to_string));

    Ok(Normalized::Event(NormalizedEvent {
        provider_event_id: event.id.clone(),
        ical_uid: non_empty(event.ical_uid.as_ref()),
        recurring_event_id: non_empty(event.recurring_event_id.as_ref()),
        original_start_time: resolve(event.original_start_time.as_ref()).map(|(dt, _)| dt),
        title: non_empty(event.summary.as_ref()),
        start_at,
        end_at,
        all_day: start_is_date && end_is_date,
        status: non_empty(event.status.as_ref()),
        provider_updated_at: event.updated,
        etag: non_empty(event.etag.as_ref()),
        time_zone,
    }))
}

/// A fetched page split into what gets upserted, cancelled and dropped.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub events: Vec<NormalizedEvent>,
    pub cancelled_ids: Vec<String>,
    pub invalid: usize,
}

impl NormalizedBatch {
    /// Normalize every item. Rejected items are logged and counted, never fatal.
    pub fn from_items(items: &[ProviderEvent], calendar_time_zone: Option<&str>) -> Self {
        let mut batch = NormalizedBatch::default();

        for item in items {
            match normalize(item, calendar_time_zone) {
                Ok(Normalized::Event(event)) => batch.events.push(event),
                Ok(Normalized::Cancelled { provider_event_id }) => {
                    batch.cancelled_ids.push(provider_event_id)
                }
                Err(reason) => {
                    warn!(provider_event_id = %item.id, %reason, "skipping invalid event");
                    batch.invalid += 1;
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32) -> ProviderEventTime {
        ProviderEventTime {
            date_time: Some(Utc.with_ymd_and_hms(2025, 3, 20, h, m, 0).unwrap()),
            ..Default::default()
        }
    }

    fn day(d: u32) -> ProviderEventTime {
        ProviderEventTime {
            date: NaiveDate::from_ymd_opt(2025, 3, d),
            ..Default::default()
        }
    }

    fn event(id: &str, start: Option<ProviderEventTime>, end: Option<ProviderEventTime>) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            status: Some("confirmed".into()),
            summary: Some("Standup".into()),
            start,
            end,
            ..Default::default()
        }
    }

    fn expect_event(result: Result<Normalized, RejectReason>) -> NormalizedEvent {
        match result {
            Ok(Normalized::Event(e)) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_ignores_other_fields() {
        let cancelled = ProviderEvent {
            id: "gone".into(),
            status: Some("cancelled".into()),
            ..Default::default()
        };

        assert_eq!(
            normalize(&cancelled, None),
            Ok(Normalized::Cancelled {
                provider_event_id: "gone".into()
            })
        );
    }

    #[test]
    fn test_timed_event() {
        let e = expect_event(normalize(&event("a", Some(at(10, 0)), Some(at(11, 0))), None));
        assert_eq!(e.start_at, Utc.with_ymd_and_hms(2025, 3, 20, 10, 0, 0).unwrap());
        assert_eq!(e.end_at, Utc.with_ymd_and_hms(2025, 3, 20, 11, 0, 0).unwrap());
        assert!(!e.all_day);
        assert_eq!(e.title.as_deref(), Some("Standup"));
        assert_eq!(e.status.as_deref(), Some("confirmed"));
    }

    #[test]
    fn test_date_only_is_midnight_utc_and_all_day() {
        let e = expect_event(normalize(&event("a", Some(day(20)), Some(day(21))), None));
        assert_eq!(e.start_at, Utc.with_ymd_and_hms(2025, 3, 20, 0, 0, 0).unwrap());
        assert_eq!(e.end_at, Utc.with_ymd_and_hms(2025, 3, 21, 0, 0, 0).unwrap());
        assert!(e.all_day);
    }

    #[test]
    fn test_mixed_bounds_are_not_all_day() {
        let e = expect_event(normalize(&event("a", Some(day(20)), Some(at(9, 0))), None));
        assert!(!e.all_day);
    }

    #[test]
    fn test_rejects_missing_or_inverted_bounds() {
        assert_eq!(
            normalize(&event("a", None, Some(at(11, 0))), None),
            Err(RejectReason::MissingStart)
        );
        assert_eq!(
            normalize(&event("a", Some(at(10, 0)), Some(ProviderEventTime::default())), None),
            Err(RejectReason::MissingEnd)
        );
        assert_eq!(
            normalize(&event("a", Some(at(10, 0)), Some(at(10, 0))), None),
            Err(RejectReason::EndNotAfterStart)
        );
        assert_eq!(
            normalize(&event("", Some(at(10, 0)), Some(at(11, 0))), None),
            Err(RejectReason::MissingId)
        );
    }

    #[test]
    fn test_time_zone_precedence() {
        let mut with_tz = event("a", Some(at(10, 0)), Some(at(11, 0)));
        let e = expect_event(normalize(&with_tz, Some("UTC")));
        assert_eq!(e.time_zone.as_deref(), Some("UTC"));

        with_tz.start.as_mut().unwrap().time_zone = Some("Europe/Berlin".into());
        let e = expect_event(normalize(&with_tz, Some("UTC")));
        assert_eq!(e.time_zone.as_deref(), Some("Europe/Berlin"));

        let e = expect_event(normalize(&event("a", Some(at(10, 0)), Some(at(11, 0))), None));
        assert_eq!(e.time_zone, None);
    }

    #[test]
    fn test_recurrence_exception_fields() {
        let mut exception = event("a_20250320", Some(at(10, 0)), Some(at(11, 0)));
        exception.recurring_event_id = Some("a".into());
        exception.original_start_time = Some(at(9, 0));
        exception.ical_uid = Some("a@google.com".into());
        exception.etag = Some("\"42\"".into());

        let e = expect_event(normalize(&exception, None));
        assert_eq!(e.recurring_event_id.as_deref(), Some("a"));
        assert_eq!(
            e.original_start_time,
            Some(Utc.with_ymd_and_hms(2025, 3, 20, 9, 0, 0).unwrap())
        );
        assert_eq!(e.ical_uid.as_deref(), Some("a@google.com"));
        assert_eq!(e.etag.as_deref(), Some("\"42\""));
    }

    #[test]
    fn test_batch_counts_invalid_without_failing() {
        let items = vec![
            event("a", Some(at(10, 0)), Some(at(11, 0))),
            event("bad", Some(at(11, 0)), Some(at(10, 0))),
            ProviderEvent {
                id: "b".into(),
                status: Some("cancelled".into()),
                ..Default::default()
            },
        ];

        let batch = NormalizedBatch::from_items(&items, None);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.cancelled_ids, vec!["b".to_string()]);
        assert_eq!(batch.invalid, 1);
    }
}
