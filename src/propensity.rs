use std::collections::BTreeSet;
use std::hash::Hasher;

use fnv::FnvHasher;

use crate::models::{FeatureRow, ScoreRow};

/// Below this many positive labels the model degrades to a constant
/// baseline instead of fitting.
pub const MIN_POSITIVE_LABELS: usize = 10;

const HOLDOUT_BUCKETS: u64 = 4;
const EPOCHS: usize = 400;
const LEARNING_RATE: f64 = 0.3;
const L2_PENALTY: f64 = 1e-3;

/// Soft-fail outcome of a fit: a real model with its evaluation and
/// coefficient readout, or a flagged constant baseline.
#[derive(Debug, Clone)]
pub enum ModelOutcome {
    Scored {
        auc: Option<f64>,
        coefficients: Vec<(String, f64)>,
    },
    Baseline {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct PropensityResult {
    /// One score per feature row, same order as the input table.
    pub scores: Vec<ScoreRow>,
    pub outcome: ModelOutcome,
}

impl PropensityResult {
    pub fn is_baseline(&self) -> bool {
        matches!(self.outcome, ModelOutcome::Baseline { .. })
    }
}

struct Design {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
    numeric_count: usize,
}

/// Logistic regression on `activated_within_48h`, fit by full-batch
/// gradient descent from a zero initialization. Numerics are standardized
/// with train-split moments, categoricals one-hot encoded over sorted
/// observed values, and the holdout split is an FNV-1a hash of the user
/// id, so identical inputs always produce identical scores.
pub fn fit_and_score(features: &[FeatureRow]) -> PropensityResult {
    let positives = features.iter().filter(|f| f.activated_within_48h).count();

    if features.is_empty() || positives < MIN_POSITIVE_LABELS {
        let rate = if features.is_empty() {
            0.0
        } else {
            positives as f64 / features.len() as f64
        };
        let reason = format!(
            "{positives} positive labels, need at least {MIN_POSITIVE_LABELS}"
        );
        tracing::warn!(%reason, "propensity model degraded to baseline");
        return PropensityResult {
            scores: features
                .iter()
                .map(|f| ScoreRow {
                    user_id: f.user_id.clone(),
                    score: rate,
                    insufficient_data: true,
                })
                .collect(),
            outcome: ModelOutcome::Baseline { reason },
        };
    }

    let mut design = encode(features);
    let labels: Vec<f64> = features
        .iter()
        .map(|f| if f.activated_within_48h { 1.0 } else { 0.0 })
        .collect();

    let mut train: Vec<usize> = Vec::new();
    let mut holdout: Vec<usize> = Vec::new();
    for (i, row) in features.iter().enumerate() {
        if is_holdout(&row.user_id) {
            holdout.push(i);
        } else {
            train.push(i);
        }
    }
    if train.is_empty() {
        train = (0..features.len()).collect();
    }

    standardize(&mut design, &train);

    let (weights, intercept) = fit(&design.rows, &labels, &train);

    let scores: Vec<f64> = design
        .rows
        .iter()
        .map(|row| sigmoid(dot(row, &weights) + intercept))
        .collect();

    let auc = roc_auc(
        &holdout
            .iter()
            .map(|&i| (scores[i], labels[i] > 0.5))
            .collect::<Vec<_>>(),
    );

    let mut coefficients: Vec<(String, f64)> = design
        .names
        .iter()
        .cloned()
        .zip(weights.iter().copied())
        .collect();
    coefficients.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    PropensityResult {
        scores: features
            .iter()
            .zip(scores)
            .map(|(f, score)| ScoreRow {
                user_id: f.user_id.clone(),
                score,
                insufficient_data: false,
            })
            .collect(),
        outcome: ModelOutcome::Scored { auc, coefficients },
    }
}

/// Experiment-targeting list: users who have not activated yet, ranked by
/// score descending with user id as the tie-break.
pub fn rank_targets(features: &[FeatureRow], result: &PropensityResult) -> Vec<(String, f64)> {
    let mut targets: Vec<(String, f64)> = features
        .iter()
        .zip(&result.scores)
        .filter(|(f, _)| !f.activated_within_48h)
        .map(|(_, s)| (s.user_id.clone(), s.score))
        .collect();

    targets.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    targets
}

fn is_holdout(user_id: &str) -> bool {
    let mut hasher = FnvHasher::default();
    hasher.write(user_id.as_bytes());
    hasher.finish() % HOLDOUT_BUCKETS == 0
}

fn encode(features: &[FeatureRow]) -> Design {
    let mut names = vec![
        "time_to_first_output_min".to_string(),
        "has_first_output".to_string(),
        "early_error_count".to_string(),
        "latency_mean_ms".to_string(),
        "template_used".to_string(),
    ];
    let numeric_count = names.len();

    let mut levels: Vec<(&str, Vec<String>)> = Vec::new();
    for field in ["channel", "platform", "intent"] {
        let values: BTreeSet<&str> = features.iter().map(|f| categorical(f, field)).collect();
        let values: Vec<String> = values.into_iter().map(str::to_string).collect();
        for value in &values {
            names.push(format!("{field}={value}"));
        }
        levels.push((field, values));
    }

    let rows = features
        .iter()
        .map(|f| {
            let mut row = vec![
                f.time_to_first_output_min.unwrap_or(0.0),
                if f.time_to_first_output_min.is_some() { 1.0 } else { 0.0 },
                f.early_error_count as f64,
                f.latency_mean_ms,
                if f.template_used { 1.0 } else { 0.0 },
            ];
            for (field, values) in &levels {
                let actual = categorical(f, field);
                for value in values {
                    row.push(if value.as_str() == actual { 1.0 } else { 0.0 });
                }
            }
            row
        })
        .collect();

    Design {
        names,
        rows,
        numeric_count,
    }
}

fn categorical<'a>(row: &'a FeatureRow, field: &str) -> &'a str {
    match field {
        "channel" => &row.channel,
        "platform" => &row.platform,
        _ => &row.intent,
    }
}

/// Standardizes the numeric columns in place with train-split moments;
/// one-hot columns stay 0/1.
fn standardize(design: &mut Design, train: &[usize]) {
    for col in 0..design.numeric_count {
        let n = train.len() as f64;
        let mean = train.iter().map(|&i| design.rows[i][col]).sum::<f64>() / n;
        let variance = train
            .iter()
            .map(|&i| (design.rows[i][col] - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        let std = if std > 0.0 { std } else { 1.0 };

        for row in &mut design.rows {
            row[col] = (row[col] - mean) / std;
        }
    }
}

fn fit(rows: &[Vec<f64>], labels: &[f64], train: &[usize]) -> (Vec<f64>, f64) {
    let dims = rows.first().map_or(0, Vec::len);
    let mut weights = vec![0.0; dims];
    let mut intercept = 0.0;
    let n = train.len() as f64;

    for _ in 0..EPOCHS {
        let mut grad_w = vec![0.0; dims];
        let mut grad_b = 0.0;

        for &i in train {
            let residual = sigmoid(dot(&rows[i], &weights) + intercept) - labels[i];
            for (g, x) in grad_w.iter_mut().zip(&rows[i]) {
                *g += residual * x;
            }
            grad_b += residual;
        }

        for (w, g) in weights.iter_mut().zip(&grad_w) {
            *w -= LEARNING_RATE * (g / n + L2_PENALTY * *w);
        }
        intercept -= LEARNING_RATE * grad_b / n;
    }

    (weights, intercept)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z.clamp(-30.0, 30.0)).exp())
}

/// Rank-based ROC AUC with average ranks over ties. None when the sample
/// is single-class.
fn roc_auc(scored: &[(f64, bool)]) -> Option<f64> {
    let n_pos = scored.iter().filter(|(_, label)| *label).count();
    let n_neg = scored.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut sorted: Vec<&(f64, bool)> = scored.iter().collect();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j].0 == sorted[i].0 {
            j += 1;
        }
        let average_rank = (i + 1 + j) as f64 / 2.0;
        for item in &sorted[i..j] {
            if item.1 {
                rank_sum_pos += average_rank;
            }
        }
        i = j;
    }

    let u = rank_sum_pos - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}
