//! Translation from raw report change records to notification events.
//!
//! A report row carries `id`, `area`, `start_time` and `end_time`. A new row
//! means work started; an update that sets `end_time` for the first time means
//! work finished. Every other change is ignored.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use snowline_common::types::{ChangeRecord, ChangeType, NotificationEvent, NotificationKind};

pub fn translate_change(record: &ChangeRecord) -> Option<NotificationEvent> {
    match record.event_type {
        ChangeType::Insert => translate_insert(record),
        ChangeType::Update => translate_update(record),
        ChangeType::Delete => {
            tracing::warn!(table = %record.table, "Ignoring DELETE change record");
            None
        }
    }
}

fn translate_insert(record: &ChangeRecord) -> Option<NotificationEvent> {
    let Some(row) = record.new.as_ref().and_then(ReportRow::from_value) else {
        tracing::warn!(table = %record.table, "Malformed INSERT change record, no event produced");
        return None;
    };

    let timestamp = row.start_time.unwrap_or_else(Utc::now);
    let message = format!("Snow removal started in {}", row.area);
    Some(NotificationEvent::new(row.area, NotificationKind::Start, row.id, message, timestamp))
}

fn translate_update(record: &ChangeRecord) -> Option<NotificationEvent> {
    let Some(new) = record.new.as_ref() else {
        tracing::warn!(table = %record.table, "UPDATE change record without new row");
        return None;
    };
    let Some(row) = ReportRow::from_value(new) else {
        tracing::warn!(table = %record.table, "Malformed UPDATE change record, no event produced");
        return None;
    };

    let was_ended = record.old.as_ref().is_some_and(|old| is_set(old.get("end_time")));
    if was_ended || !is_set(new.get("end_time")) {
        tracing::debug!(report_id = %row.id, "UPDATE does not finish the report, ignored");
        return None;
    }

    let timestamp = row.end_time.unwrap_or_else(Utc::now);
    let message = format!("Snow removal finished in {}", row.area);
    Some(NotificationEvent::new(row.area, NotificationKind::End, row.id, message, timestamp))
}

struct ReportRow {
    id: String,
    area: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl ReportRow {
    fn from_value(value: &Value) -> Option<Self> {
        let id = match value.get("id")? {
            Value::Number(n) => n.to_string(),
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => return None,
        };
        let area = value.get("area")?.as_str()?.trim();
        if area.is_empty() {
            return None;
        }

        Some(Self {
            id,
            area: area.to_string(),
            start_time: value.get("start_time").and_then(parse_timestamp),
            end_time: value.get("end_time").and_then(parse_timestamp),
        })
    }
}

fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS` form databases emit.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
