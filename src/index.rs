use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::models::{Event, SIGNUP};

/// Grouped reductions over the event set, built once and shared read-only
/// by the funnel, cohort, and feature components.
#[derive(Debug, Default)]
pub struct EventIndex {
    first_seen: HashMap<(String, String), NaiveDateTime>,
    user_events: HashMap<String, Vec<NaiveDateTime>>,
    event_users: HashMap<String, HashSet<String>>,
    max_timestamp: Option<NaiveDateTime>,
}

impl EventIndex {
    pub fn build(events: &[Event]) -> Self {
        let mut index = EventIndex::default();

        for event in events {
            let key = (event.user_id.clone(), event.event_name.clone());
            index
                .first_seen
                .entry(key)
                .and_modify(|ts| {
                    if event.timestamp < *ts {
                        *ts = event.timestamp;
                    }
                })
                .or_insert(event.timestamp);

            index
                .user_events
                .entry(event.user_id.clone())
                .or_default()
                .push(event.timestamp);

            index
                .event_users
                .entry(event.event_name.clone())
                .or_default()
                .insert(event.user_id.clone());

            index.max_timestamp = Some(match index.max_timestamp {
                Some(max) if max >= event.timestamp => max,
                _ => event.timestamp,
            });
        }

        for timestamps in index.user_events.values_mut() {
            timestamps.sort_unstable();
        }

        index
    }

    pub fn first_event_time(&self, user_id: &str, event_name: &str) -> Option<NaiveDateTime> {
        self.first_seen
            .get(&(user_id.to_string(), event_name.to_string()))
            .copied()
    }

    pub fn distinct_user_count(&self, event_name: &str) -> u64 {
        self.event_users
            .get(event_name)
            .map_or(0, |users| users.len() as u64)
    }

    /// Users with a signup event and their signup times, ordered by user id.
    pub fn signup_times(&self) -> Vec<(&str, NaiveDateTime)> {
        let mut users: Vec<(&str, NaiveDateTime)> = self
            .first_seen
            .iter()
            .filter(|((_, name), _)| name == SIGNUP)
            .map(|((user, _), ts)| (user.as_str(), *ts))
            .collect();
        users.sort_unstable_by(|a, b| a.0.cmp(b.0));
        users
    }

    /// All event timestamps for a user, sorted ascending.
    pub fn events_for(&self, user_id: &str) -> &[NaiveDateTime] {
        self.user_events.get(user_id).map_or(&[], Vec::as_slice)
    }

    /// Latest timestamp observed anywhere in the source. Stands in for
    /// "now" so the pipeline never reads the system clock.
    pub fn max_timestamp(&self) -> Option<NaiveDateTime> {
        self.max_timestamp
    }
}
