use std::fmt::Write;

use crate::models::{CohortRow, FeatureRow, FunnelRow};
use crate::propensity::{self, ModelOutcome, PropensityResult};

/// Activation rate grouped by an arbitrary bucketing of feature rows,
/// sorted by bucket label. Buckets are (label, users, activation rate).
pub fn activation_by<F>(features: &[FeatureRow], bucket: F) -> Vec<(String, usize, f64)>
where
    F: Fn(&FeatureRow) -> String,
{
    let mut map: std::collections::BTreeMap<String, (usize, usize)> =
        std::collections::BTreeMap::new();

    for row in features {
        let entry = map.entry(bucket(row)).or_insert((0, 0));
        entry.0 += 1;
        if row.activated_within_48h {
            entry.1 += 1;
        }
    }

    map.into_iter()
        .map(|(label, (count, activated))| {
            let rate = if count == 0 {
                0.0
            } else {
                activated as f64 / count as f64
            };
            (label, count, rate)
        })
        .collect()
}

pub fn error_bucket(count: u32) -> String {
    match count {
        0 => "0".to_string(),
        1 => "1".to_string(),
        _ => "2+".to_string(),
    }
}

pub fn build_report(
    funnel: &[FunnelRow],
    cohorts: &[CohortRow],
    features: &[FeatureRow],
    propensity: &PropensityResult,
) -> String {
    let mut output = String::new();

    let activation_rate = if features.is_empty() {
        0.0
    } else {
        features.iter().filter(|f| f.activated_within_48h).count() as f64
            / features.len() as f64
    };

    let _ = writeln!(output, "# Activation Metrics Report");
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "- Activation (ship within 48h): {:.1}% of {} signed-up users",
        activation_rate * 100.0,
        features.len()
    );
    match week_one_retention(cohorts) {
        Some(rate) => {
            let _ = writeln!(output, "- Week-1 retention: {:.1}%", rate * 100.0);
        }
        None => {
            let _ = writeln!(output, "- Week-1 retention: not yet observable");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Funnel");

    for row in funnel {
        if row.zero_conversion {
            let _ = writeln!(
                output,
                "- {}: {} users (previous step empty)",
                row.step, row.distinct_user_count
            );
        } else {
            let _ = writeln!(
                output,
                "- {}: {} users ({:.1}% from previous)",
                row.step,
                row.distinct_user_count,
                row.conversion_from_previous * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Cohort Retention");

    if cohorts.is_empty() {
        let _ = writeln!(output, "No signup cohorts in this window.");
    }
    for row in cohorts {
        match (row.retained_count, row.retained_rate) {
            (Some(count), Some(rate)) => {
                let _ = writeln!(
                    output,
                    "- {} week {}: {:.1}% ({}/{})",
                    row.cohort_week,
                    row.week_offset,
                    rate * 100.0,
                    count,
                    row.cohort_size
                );
            }
            _ => {
                let _ = writeln!(
                    output,
                    "- {} week {}: pending ({} users)",
                    row.cohort_week, row.week_offset, row.cohort_size
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Activation Drivers");

    let _ = writeln!(output, "By early errors:");
    for (label, count, rate) in activation_by(features, |f| error_bucket(f.early_error_count)) {
        let _ = writeln!(
            output,
            "- {} errors: {:.1}% of {} users",
            label,
            rate * 100.0,
            count
        );
    }

    let _ = writeln!(output, "By first-day latency:");
    for (label, count, rate) in activation_by(features, |f| f.latency_bucket.clone()) {
        let _ = writeln!(
            output,
            "- {} ms: {:.1}% of {} users",
            label,
            rate * 100.0,
            count
        );
    }

    let by_template = activation_by(features, |f| f.template_used.to_string());
    if by_template.len() == 2 {
        let with = by_template.iter().find(|(label, _, _)| label == "true");
        let without = by_template.iter().find(|(label, _, _)| label == "false");
        if let (Some((_, _, with_rate)), Some((_, _, without_rate))) = (with, without) {
            let _ = writeln!(
                output,
                "Template uplift: {:+.1} points",
                (with_rate - without_rate) * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Propensity Model");

    match &propensity.outcome {
        ModelOutcome::Scored { auc, coefficients } => {
            match auc {
                Some(auc) => {
                    let _ = writeln!(output, "Logistic regression, held-out ROC AUC {auc:.3}.");
                }
                None => {
                    let _ = writeln!(
                        output,
                        "Logistic regression (held-out split was single-class, AUC n/a)."
                    );
                }
            }
            let _ = writeln!(output, "Top coefficients:");
            for (name, coef) in coefficients.iter().take(5) {
                let _ = writeln!(output, "- {name}: {coef:+.3}");
            }
        }
        ModelOutcome::Baseline { reason } => {
            let _ = writeln!(output, "Degraded to constant baseline: {reason}.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Experiment Targets");

    let targets = propensity::rank_targets(features, propensity);
    if targets.is_empty() {
        let _ = writeln!(output, "No unactivated users to target.");
    }
    for (user, score) in targets.iter().take(10) {
        let _ = writeln!(output, "- {user} (score {score:.3})");
    }

    output
}

/// Pooled week-1 retention across cohorts whose offset-1 window has
/// closed; None while nothing is observable yet.
fn week_one_retention(cohorts: &[CohortRow]) -> Option<f64> {
    let mut retained = 0u64;
    let mut size = 0u64;

    for row in cohorts {
        if row.week_offset == 1 && row.observable {
            retained += row.retained_count.unwrap_or(0);
            size += row.cohort_size;
        }
    }

    if size == 0 {
        None
    } else {
        Some(retained as f64 / size as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScoreRow;

    fn feature(user: &str, activated: bool, errors: u32) -> FeatureRow {
        FeatureRow {
            user_id: user.to_string(),
            cohort_week: "2026-W02".to_string(),
            time_to_first_output_min: Some(30.0),
            early_error_count: errors,
            latency_mean_ms: 400.0,
            latency_bucket: "<500".to_string(),
            template_used: activated,
            activated_within_48h: activated,
            channel: "organic".to_string(),
            platform: "web".to_string(),
            intent: "build_app".to_string(),
        }
    }

    #[test]
    fn buckets_activation_rates() {
        let features = vec![
            feature("u1", true, 0),
            feature("u2", false, 0),
            feature("u3", false, 2),
        ];

        let buckets = activation_by(&features, |f| error_bucket(f.early_error_count));
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], ("0".to_string(), 2, 0.5));
        assert_eq!(buckets[1], ("2+".to_string(), 1, 0.0));
    }

    #[test]
    fn report_surfaces_baseline_reason_and_targets() {
        let features = vec![feature("u1", false, 1)];
        let propensity = PropensityResult {
            scores: vec![ScoreRow {
                user_id: "u1".to_string(),
                score: 0.2,
                insufficient_data: true,
            }],
            outcome: ModelOutcome::Baseline {
                reason: "0 positive labels, need at least 10".to_string(),
            },
        };

        let report = build_report(&[], &[], &features, &propensity);
        assert!(report.contains("Degraded to constant baseline"));
        assert!(report.contains("- u1 (score 0.200)"));
        assert!(report.contains("Week-1 retention: not yet observable"));
    }
}
