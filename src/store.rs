use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::{PipelineError, Result};
use crate::models::Event;

pub const REQUIRED_COLUMNS: [&str; 3] = ["user_id", "event_name", "timestamp"];

/// Per-run ingestion counters, reported at end of run and in the manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadSummary {
    pub total_rows: usize,
    pub dropped_invalid: usize,
    pub dropped_duplicate: usize,
}

#[derive(Debug, Clone)]
pub struct EventSet {
    pub events: Vec<Event>,
    pub summary: ReadSummary,
}

#[derive(serde::Deserialize)]
struct CsvRow {
    user_id: String,
    event_name: String,
    timestamp: String,
    #[serde(flatten)]
    attributes: BTreeMap<String, String>,
}

/// Reads the raw event source. `path` may be the events file itself or a
/// directory containing `events.csv`. Unreadable source is fatal; invalid
/// and duplicate records are dropped and counted.
pub fn read_events(path: &Path) -> Result<EventSet> {
    let file_path = if path.is_dir() {
        path.join("events.csv")
    } else {
        path.to_path_buf()
    };

    let file = std::fs::File::open(&file_path).map_err(|source| {
        PipelineError::SourceUnavailable {
            path: file_path.clone(),
            source,
        }
    })?;

    read_events_from(file)
}

/// Reader-level entry point, split out so tests can feed CSV bytes directly.
pub fn read_events_from<R: Read>(reader: R) -> Result<EventSet> {
    let mut csv_reader = csv::Reader::from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|err| PipelineError::SchemaMismatch(format!("unreadable header row: {err}")))?
        .clone();

    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(PipelineError::SchemaMismatch(format!(
                "missing required column `{column}`"
            )));
        }
    }

    let mut summary = ReadSummary::default();
    let mut seen: HashSet<(String, String, NaiveDateTime)> = HashSet::new();
    let mut events = Vec::new();

    for record in csv_reader.deserialize::<CsvRow>() {
        summary.total_rows += 1;

        let row = match record {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(error = %err, "dropping undeserializable record");
                summary.dropped_invalid += 1;
                continue;
            }
        };

        if row.user_id.is_empty() || row.event_name.is_empty() {
            summary.dropped_invalid += 1;
            continue;
        }

        let Some(timestamp) = parse_timestamp(&row.timestamp) else {
            summary.dropped_invalid += 1;
            continue;
        };

        let key = (row.user_id.clone(), row.event_name.clone(), timestamp);
        if !seen.insert(key) {
            summary.dropped_duplicate += 1;
            continue;
        }

        let attributes: BTreeMap<String, String> = row
            .attributes
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();

        events.push(Event {
            user_id: row.user_id,
            event_name: row.event_name,
            timestamp,
            attributes,
        });
    }

    // Per-user ordering is derived here; the source makes no global promise.
    events.sort_by(|a, b| {
        (a.user_id.as_str(), a.timestamp, a.event_name.as_str()).cmp(&(
            b.user_id.as_str(),
            b.timestamp,
            b.event_name.as_str(),
        ))
    });

    Ok(EventSet { events, summary })
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(csv: &str) -> EventSet {
        read_events_from(csv.as_bytes()).expect("readable csv")
    }

    #[test]
    fn parses_and_sorts_events_per_user() {
        let set = read(
            "user_id,event_name,timestamp,latency_ms\n\
             u2,signup,2026-01-05T10:00:00,\n\
             u1,first_prompt,2026-01-04T10:05:00,812.5\n\
             u1,signup,2026-01-04T10:00:00,\n",
        );

        assert_eq!(set.events.len(), 3);
        assert_eq!(set.summary.dropped_invalid, 0);
        assert_eq!(set.events[0].user_id, "u1");
        assert_eq!(set.events[0].event_name, "signup");
        assert_eq!(set.events[1].event_name, "first_prompt");
        assert_eq!(
            set.events[1].attributes.get("latency_ms").map(String::as_str),
            Some("812.5")
        );
        assert!(set.events[0].attributes.is_empty());
    }

    #[test]
    fn drops_and_counts_invalid_records() {
        let set = read(
            "user_id,event_name,timestamp\n\
             u1,signup,2026-01-04T10:00:00\n\
             ,signup,2026-01-04T10:00:00\n\
             u2,,2026-01-04T10:00:00\n\
             u3,signup,not-a-timestamp\n",
        );

        assert_eq!(set.events.len(), 1);
        assert_eq!(set.summary.total_rows, 4);
        assert_eq!(set.summary.dropped_invalid, 3);
    }

    #[test]
    fn deduplicates_identical_tuples() {
        let set = read(
            "user_id,event_name,timestamp\n\
             u1,signup,2026-01-04T10:00:00\n\
             u1,signup,2026-01-04T10:00:00\n\
             u1,signup,2026-01-04T10:00:01\n",
        );

        assert_eq!(set.events.len(), 2);
        assert_eq!(set.summary.dropped_duplicate, 1);
    }

    #[test]
    fn missing_required_column_is_schema_mismatch() {
        let err = read_events_from("user_id,timestamp\nu1,2026-01-04\n".as_bytes())
            .expect_err("missing event_name");
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_events(&dir.path().join("nope.csv")).expect_err("missing file");
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn accepts_rfc3339_and_date_only_timestamps() {
        let set = read(
            "user_id,event_name,timestamp\n\
             u1,signup,2026-01-04T10:00:00+02:00\n\
             u2,signup,2026-01-04\n",
        );

        assert_eq!(set.events.len(), 2);
        assert_eq!(
            set.events[0].timestamp,
            NaiveDate::from_ymd_opt(2026, 1, 4)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        );
    }
}
