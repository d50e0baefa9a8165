use std::collections::HashMap;

use chrono::Duration;

use crate::cohort::cohort_week;
use crate::index::EventIndex;
use crate::models::{
    Event, FeatureRow, ERROR_EVENTS, FIRST_OUTPUT, PROJECT_SHIPPED, SIGNUP, TEMPLATE_USED,
};

/// Errors are counted up to first_output, or this long after signup when
/// first_output never happened.
pub const EARLY_ERROR_LOOKBACK_HOURS: i64 = 24;
pub const ACTIVATION_WINDOW_HOURS: i64 = 48;
/// First-session window for latency and template-usage features.
pub const ACTIVITY_WINDOW_HOURS: i64 = 24;

/// Sentinel for missing categorical attributes, so downstream grouping
/// never has to deal with nulls.
pub const UNKNOWN: &str = "unknown";

pub fn latency_bucket(mean_ms: f64) -> &'static str {
    if mean_ms <= 500.0 {
        "<500"
    } else if mean_ms <= 1000.0 {
        "500-1000"
    } else if mean_ms <= 2000.0 {
        "1000-2000"
    } else {
        ">2000"
    }
}

fn is_error_event(name: &str) -> bool {
    ERROR_EVENTS.contains(&name)
}

/// One row per user with a signup event, ordered by user id. Built once
/// per run and never mutated afterward.
pub fn build_features(events: &[Event], index: &EventIndex) -> Vec<FeatureRow> {
    let mut by_user: HashMap<&str, Vec<&Event>> = HashMap::new();
    for event in events {
        by_user.entry(event.user_id.as_str()).or_default().push(event);
    }

    let mut rows = Vec::new();

    for (user, signup) in index.signup_times() {
        let user_events = by_user.get(user).map_or(&[][..], Vec::as_slice);

        let first_output = index.first_event_time(user, FIRST_OUTPUT);
        let time_to_first_output_min =
            first_output.map(|fo| (fo - signup).num_seconds() as f64 / 60.0);

        // Errors at exactly first_output count; strictly after never do.
        let error_cutoff =
            first_output.unwrap_or(signup + Duration::hours(EARLY_ERROR_LOOKBACK_HOURS));
        let early_error_count = user_events
            .iter()
            .filter(|e| is_error_event(&e.event_name))
            .filter(|e| e.timestamp >= signup && e.timestamp <= error_cutoff)
            .count() as u32;

        let activity_end = signup + Duration::hours(ACTIVITY_WINDOW_HOURS);
        let latencies: Vec<f64> = user_events
            .iter()
            .filter(|e| e.timestamp >= signup && e.timestamp <= activity_end)
            .filter_map(|e| e.attributes.get("latency_ms"))
            .filter_map(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .collect();
        let latency_mean_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let template_used = user_events.iter().any(|e| {
            e.event_name == TEMPLATE_USED && e.timestamp >= signup && e.timestamp <= activity_end
        });

        let activated_within_48h = index
            .first_event_time(user, PROJECT_SHIPPED)
            .map(|shipped| shipped - signup <= Duration::hours(ACTIVATION_WINDOW_HOURS))
            .unwrap_or(false);

        let signup_event = user_events
            .iter()
            .find(|e| e.event_name == SIGNUP && e.timestamp == signup);
        let attribute = |key: &str| -> String {
            signup_event
                .and_then(|e| e.attributes.get(key))
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        rows.push(FeatureRow {
            user_id: user.to_string(),
            cohort_week: cohort_week(signup),
            time_to_first_output_min,
            early_error_count,
            latency_mean_ms,
            latency_bucket: latency_bucket(latency_mean_ms).to_string(),
            template_used,
            activated_within_48h,
            channel: attribute("channel"),
            platform: attribute("platform"),
            intent: attribute("intent"),
        });
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::BTreeMap;

    fn ts(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn ev(user: &str, name: &str, timestamp: NaiveDateTime) -> Event {
        Event {
            user_id: user.to_string(),
            event_name: name.to_string(),
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    fn ev_attrs(user: &str, name: &str, timestamp: NaiveDateTime, attrs: &[(&str, &str)]) -> Event {
        Event {
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..ev(user, name, timestamp)
        }
    }

    fn build(events: Vec<Event>) -> Vec<FeatureRow> {
        let index = crate::index::EventIndex::build(&events);
        build_features(&events, &index)
    }

    #[test]
    fn shipping_within_two_days_activates() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u1", "first_prompt", ts(5, 10, 0)),
            ev("u1", "first_output", ts(5, 11, 0)),
            ev("u1", "project_shipped", ts(5, 19, 0)),
        ]);

        assert_eq!(rows.len(), 1);
        assert!(rows[0].activated_within_48h);
        assert_eq!(rows[0].time_to_first_output_min, Some(120.0));
    }

    #[test]
    fn shipping_after_two_days_does_not_activate() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u1", "project_shipped", ts(8, 9, 0)),
        ]);

        assert!(!rows[0].activated_within_48h);
    }

    #[test]
    fn signup_only_user_gets_null_and_zero_features() {
        let rows = build(vec![ev("u1", "signup", ts(5, 9, 0))]);

        let row = &rows[0];
        assert_eq!(row.time_to_first_output_min, None);
        assert_eq!(row.early_error_count, 0);
        assert_eq!(row.latency_mean_ms, 0.0);
        assert!(!row.template_used);
        assert!(!row.activated_within_48h);
        assert_eq!(row.channel, "unknown");
        assert_eq!(row.platform, "unknown");
        assert_eq!(row.intent, "unknown");
    }

    #[test]
    fn users_without_signup_are_excluded() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u2", "first_prompt", ts(5, 9, 0)),
        ]);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "u1");
    }

    #[test]
    fn errors_after_first_output_never_count() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u1", "error_hit", ts(5, 9, 30)),
            ev("u1", "first_output", ts(5, 10, 0)),
            // At the boundary: counts.
            ev("u1", "error_hit", ts(5, 10, 0)),
            // Strictly after: never counts.
            ev("u1", "error_hit", ts(5, 11, 0)),
        ]);

        assert_eq!(rows[0].early_error_count, 2);
    }

    #[test]
    fn errors_fall_back_to_first_day_without_first_output() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u1", "error_hit", ts(5, 20, 0)),
            ev("u1", "error_hit", ts(7, 9, 0)),
        ]);

        assert_eq!(rows[0].early_error_count, 1);
    }

    #[test]
    fn latency_mean_ignores_missing_and_non_positive_values() {
        let rows = build(vec![
            ev_attrs("u1", "signup", ts(5, 9, 0), &[]),
            ev_attrs("u1", "first_prompt", ts(5, 9, 5), &[("latency_ms", "600")]),
            ev_attrs("u1", "first_output", ts(5, 9, 6), &[("latency_ms", "1400")]),
            ev_attrs("u1", "multi_step_session", ts(5, 10, 0), &[("latency_ms", "0")]),
        ]);

        assert_eq!(rows[0].latency_mean_ms, 1000.0);
        assert_eq!(rows[0].latency_bucket, "500-1000");
    }

    #[test]
    fn signup_attributes_flow_through_verbatim() {
        let rows = build(vec![ev_attrs(
            "u1",
            "signup",
            ts(5, 9, 0),
            &[("channel", "paid"), ("platform", "web"), ("intent", "build_app")],
        )]);

        let row = &rows[0];
        assert_eq!(row.channel, "paid");
        assert_eq!(row.platform, "web");
        assert_eq!(row.intent, "build_app");
        assert_eq!(row.cohort_week, "2026-W02");
    }

    #[test]
    fn template_usage_only_counts_first_day() {
        let rows = build(vec![
            ev("u1", "signup", ts(5, 9, 0)),
            ev("u1", "template_used", ts(7, 9, 0)),
        ]);

        assert!(!rows[0].template_used);
    }
}
