use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDateTime};

use crate::index::EventIndex;
use crate::models::CohortRow;

#[derive(Debug, Clone, Copy)]
pub struct CohortParams {
    pub window_days: i64,
    pub max_offset: u32,
}

impl Default for CohortParams {
    fn default() -> Self {
        CohortParams {
            window_days: 7,
            max_offset: 8,
        }
    }
}

/// ISO week key for the week containing a timestamp, e.g. "2026-W03".
pub fn cohort_week(timestamp: NaiveDateTime) -> String {
    let iso = timestamp.date().iso_week();
    format!("{:04}-W{:02}", iso.year(), iso.week())
}

/// Retention matrix keyed by (cohort_week, week_offset). Windows are
/// anchored on each user's own signup time; any event inside the window
/// qualifies, so offset 0 is 1.0 for every non-empty cohort. Cells whose
/// windows are not yet closed at the max observed timestamp are published
/// as not-observable with null retained fields, never as zero.
pub fn compute_cohorts(index: &EventIndex, params: CohortParams) -> Vec<CohortRow> {
    let Some(max_timestamp) = index.max_timestamp() else {
        return Vec::new();
    };

    let mut cohorts: BTreeMap<String, Vec<(&str, NaiveDateTime)>> = BTreeMap::new();
    for (user, signup) in index.signup_times() {
        cohorts.entry(cohort_week(signup)).or_default().push((user, signup));
    }

    let mut rows = Vec::new();

    for (week, members) in &cohorts {
        let cohort_size = members.len() as u64;
        let latest_signup = members
            .iter()
            .map(|(_, signup)| *signup)
            .max()
            .unwrap_or(max_timestamp);

        for offset in 0..params.max_offset {
            let window_close =
                latest_signup + Duration::days(params.window_days * (i64::from(offset) + 1));
            // Offset 0 is complete by construction: signup is in-window.
            let observable = offset == 0 || window_close <= max_timestamp;

            if !observable {
                rows.push(CohortRow {
                    cohort_week: week.clone(),
                    week_offset: offset,
                    cohort_size,
                    retained_count: None,
                    retained_rate: None,
                    observable: false,
                });
                continue;
            }

            let mut retained = 0u64;
            for (user, signup) in members {
                let start = *signup + Duration::days(params.window_days * i64::from(offset));
                let end = *signup + Duration::days(params.window_days * (i64::from(offset) + 1));
                if index
                    .events_for(user)
                    .iter()
                    .any(|ts| *ts >= start && *ts < end)
                {
                    retained += 1;
                }
            }

            rows.push(CohortRow {
                cohort_week: week.clone(),
                week_offset: offset,
                cohort_size,
                retained_count: Some(retained),
                retained_rate: Some(retained as f64 / cohort_size as f64),
                observable: true,
            });
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Event;
    use chrono::NaiveDate;
    use std::collections::BTreeMap as AttrMap;

    fn ts(month: u32, day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, month, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn ev(user: &str, name: &str, timestamp: NaiveDateTime) -> Event {
        Event {
            user_id: user.to_string(),
            event_name: name.to_string(),
            timestamp,
            attributes: AttrMap::new(),
        }
    }

    fn params(max_offset: u32) -> CohortParams {
        CohortParams {
            window_days: 7,
            max_offset,
        }
    }

    #[test]
    fn week_zero_retention_is_one_for_non_empty_cohorts() {
        let index = crate::index::EventIndex::build(&[
            ev("u1", "signup", ts(1, 5, 9)),
            ev("u2", "signup", ts(1, 6, 9)),
            ev("sentinel", "signup", ts(3, 1, 0)),
        ]);

        let rows = compute_cohorts(&index, params(1));
        for row in rows.iter().filter(|r| r.week_offset == 0) {
            assert_eq!(row.retained_rate, Some(1.0), "cohort {}", row.cohort_week);
        }
    }

    #[test]
    fn signup_only_user_counts_in_denominator_not_later_numerators() {
        // u1 returns in week 1, u2 never does; far-future sentinel keeps
        // both offsets observable.
        let index = crate::index::EventIndex::build(&[
            ev("u1", "signup", ts(1, 5, 9)),
            ev("u1", "return_session", ts(1, 13, 9)),
            ev("u2", "signup", ts(1, 5, 10)),
            ev("sentinel", "signup", ts(6, 1, 0)),
        ]);

        let rows = compute_cohorts(&index, params(2));
        let week1 = rows
            .iter()
            .find(|r| r.cohort_week == "2026-W02" && r.week_offset == 1)
            .expect("week 1 cell");
        assert_eq!(week1.cohort_size, 2);
        assert_eq!(week1.retained_count, Some(1));
        assert_eq!(week1.retained_rate, Some(0.5));
    }

    #[test]
    fn unclosed_windows_are_null_not_zero() {
        // Max observed timestamp is only three days past signup, so the
        // offset-1 window has not closed yet.
        let index = crate::index::EventIndex::build(&[
            ev("u1", "signup", ts(1, 5, 9)),
            ev("u1", "first_output", ts(1, 8, 9)),
        ]);

        let rows = compute_cohorts(&index, params(2));
        let week1 = rows.iter().find(|r| r.week_offset == 1).expect("offset 1");
        assert!(!week1.observable);
        assert_eq!(week1.retained_count, None);
        assert_eq!(week1.retained_rate, None);

        let week0 = rows.iter().find(|r| r.week_offset == 0).expect("offset 0");
        assert!(week0.observable);
        assert_eq!(week0.retained_rate, Some(1.0));
    }

    #[test]
    fn cohort_sizes_sum_to_distinct_signup_users() {
        let index = crate::index::EventIndex::build(&[
            ev("u1", "signup", ts(1, 5, 9)),
            ev("u2", "signup", ts(1, 14, 9)),
            ev("u3", "signup", ts(1, 15, 9)),
            ev("u4", "first_prompt", ts(1, 15, 10)),
        ]);

        let rows = compute_cohorts(&index, params(1));
        let total: u64 = rows
            .iter()
            .filter(|r| r.week_offset == 0)
            .map(|r| r.cohort_size)
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn windows_are_anchored_on_each_users_signup() {
        // u1 signs up Monday, u2 Saturday of the same ISO week. An event
        // six days after signup lands in each user's own offset-0 window.
        let index = crate::index::EventIndex::build(&[
            ev("u1", "signup", ts(1, 5, 9)),
            ev("u1", "return_session", ts(1, 11, 9)),
            ev("u2", "signup", ts(1, 10, 9)),
            ev("u2", "return_session", ts(1, 16, 9)),
            ev("sentinel", "signup", ts(6, 1, 0)),
        ]);

        let rows = compute_cohorts(&index, params(2));
        let week0 = rows
            .iter()
            .find(|r| r.cohort_week == "2026-W02" && r.week_offset == 0)
            .expect("cell");
        assert_eq!(week0.retained_count, Some(2));
    }
}
