use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::models::{CohortRow, FeatureRow, FunnelRow, Manifest, SCHEMA_VERSION};
use crate::propensity::{ModelOutcome, PropensityResult};
use crate::store::ReadSummary;

pub const FUNNEL_FILE: &str = "funnel.csv";
pub const COHORTS_FILE: &str = "cohorts.csv";
pub const FEATURES_FILE: &str = "features.csv";
pub const SCORES_FILE: &str = "scores.csv";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Publishes the four tables and the manifest atomically: everything is
/// staged as `*.tmp` first and only renamed into place once every stage
/// write succeeded, so a failed run never clobbers a valid prior export.
pub fn write_exports(
    out_dir: &Path,
    funnel: &[FunnelRow],
    cohorts: &[CohortRow],
    features: &[FeatureRow],
    propensity: &PropensityResult,
    summary: &ReadSummary,
) -> Result<Manifest> {
    fs::create_dir_all(out_dir).map_err(|source| PipelineError::ExportIo {
        path: out_dir.to_path_buf(),
        source,
    })?;

    check_prior_schema(out_dir)?;

    let manifest = build_manifest(funnel, cohorts, features, propensity, summary);
    let manifest_json = serde_json::to_string_pretty(&manifest).map_err(|err| {
        PipelineError::ExportIo {
            path: out_dir.join(MANIFEST_FILE),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    })?;

    let staged: Vec<(&str, Vec<u8>)> = vec![
        (FUNNEL_FILE, funnel_csv(out_dir, funnel)?),
        (COHORTS_FILE, cohorts_csv(out_dir, cohorts)?),
        (FEATURES_FILE, features_csv(out_dir, features)?),
        (SCORES_FILE, scores_csv(out_dir, propensity)?),
        (MANIFEST_FILE, manifest_json.into_bytes()),
    ];

    let mut written: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (name, bytes) in &staged {
        let tmp = out_dir.join(format!("{name}.tmp"));
        if let Err(source) = fs::write(&tmp, bytes) {
            for (tmp, _) in &written {
                let _ = fs::remove_file(tmp);
            }
            return Err(PipelineError::ExportIo { path: tmp, source });
        }
        written.push((tmp, out_dir.join(name)));
    }

    for (tmp, target) in written {
        fs::rename(&tmp, &target).map_err(|source| PipelineError::ExportIo {
            path: target,
            source,
        })?;
    }

    Ok(manifest)
}

/// An existing manifest from another schema generation means the dashboard
/// contract changed; refuse to overwrite rather than mix schemas.
fn check_prior_schema(out_dir: &Path) -> Result<()> {
    let manifest_path = out_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&manifest_path).map_err(|err| {
        PipelineError::SchemaMismatch(format!(
            "existing manifest {} is unreadable: {err}",
            manifest_path.display()
        ))
    })?;
    let prior: Manifest = serde_json::from_str(&raw).map_err(|err| {
        PipelineError::SchemaMismatch(format!(
            "existing manifest {} does not parse: {err}",
            manifest_path.display()
        ))
    })?;

    if prior.schema_version != SCHEMA_VERSION {
        return Err(PipelineError::SchemaMismatch(format!(
            "existing export has schema version {}, this build writes {}",
            prior.schema_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn build_manifest(
    funnel: &[FunnelRow],
    cohorts: &[CohortRow],
    features: &[FeatureRow],
    propensity: &PropensityResult,
    summary: &ReadSummary,
) -> Manifest {
    let (model, auc) = match &propensity.outcome {
        ModelOutcome::Scored { auc, .. } => ("scored".to_string(), *auc),
        ModelOutcome::Baseline { .. } => ("baseline".to_string(), None),
    };

    Manifest {
        schema_version: SCHEMA_VERSION,
        events_read: summary.total_rows - summary.dropped_invalid - summary.dropped_duplicate,
        records_dropped: summary.dropped_invalid,
        duplicates_dropped: summary.dropped_duplicate,
        funnel_rows: funnel.len(),
        cohort_rows: cohorts.len(),
        feature_rows: features.len(),
        score_rows: propensity.scores.len(),
        model,
        auc,
    }
}

fn encode_csv(target: &Path, header: &[&str], rows: Vec<Vec<String>>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        let encode_err = |source| PipelineError::ExportEncode {
            path: target.to_path_buf(),
            source,
        };

        writer.write_record(header).map_err(encode_err)?;
        for row in rows {
            writer.write_record(&row).map_err(encode_err)?;
        }
        writer.flush().map_err(|source| PipelineError::ExportIo {
            path: target.to_path_buf(),
            source,
        })?;
    }
    Ok(buffer)
}

fn funnel_csv(out_dir: &Path, rows: &[FunnelRow]) -> Result<Vec<u8>> {
    encode_csv(
        &out_dir.join(FUNNEL_FILE),
        &[
            "step",
            "distinct_user_count",
            "conversion_from_previous",
            "zero_conversion",
        ],
        rows.iter()
            .map(|r| {
                vec![
                    r.step.clone(),
                    r.distinct_user_count.to_string(),
                    format!("{:.4}", r.conversion_from_previous),
                    r.zero_conversion.to_string(),
                ]
            })
            .collect(),
    )
}

fn cohorts_csv(out_dir: &Path, rows: &[CohortRow]) -> Result<Vec<u8>> {
    encode_csv(
        &out_dir.join(COHORTS_FILE),
        &[
            "cohort_week",
            "week_offset",
            "cohort_size",
            "retained_count",
            "retained_rate",
            "observable",
        ],
        rows.iter()
            .map(|r| {
                vec![
                    r.cohort_week.clone(),
                    r.week_offset.to_string(),
                    r.cohort_size.to_string(),
                    r.retained_count.map(|c| c.to_string()).unwrap_or_default(),
                    r.retained_rate
                        .map(|rate| format!("{rate:.4}"))
                        .unwrap_or_default(),
                    r.observable.to_string(),
                ]
            })
            .collect(),
    )
}

fn features_csv(out_dir: &Path, rows: &[FeatureRow]) -> Result<Vec<u8>> {
    encode_csv(
        &out_dir.join(FEATURES_FILE),
        &[
            "user_id",
            "cohort_week",
            "time_to_first_output_min",
            "early_error_count",
            "latency_mean_ms",
            "latency_bucket",
            "template_used",
            "activated_within_48h",
            "channel",
            "platform",
            "intent",
        ],
        rows.iter()
            .map(|r| {
                vec![
                    r.user_id.clone(),
                    r.cohort_week.clone(),
                    r.time_to_first_output_min
                        .map(|m| format!("{m:.2}"))
                        .unwrap_or_default(),
                    r.early_error_count.to_string(),
                    format!("{:.1}", r.latency_mean_ms),
                    r.latency_bucket.clone(),
                    r.template_used.to_string(),
                    r.activated_within_48h.to_string(),
                    r.channel.clone(),
                    r.platform.clone(),
                    r.intent.clone(),
                ]
            })
            .collect(),
    )
}

fn scores_csv(out_dir: &Path, propensity: &PropensityResult) -> Result<Vec<u8>> {
    encode_csv(
        &out_dir.join(SCORES_FILE),
        &["user_id", "score", "insufficient_data"],
        propensity
            .scores
            .iter()
            .map(|r| {
                vec![
                    r.user_id.clone(),
                    format!("{:.6}", r.score),
                    r.insufficient_data.to_string(),
                ]
            })
            .collect(),
    )
}
