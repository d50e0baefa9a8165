use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cohort;
mod error;
mod export;
mod features;
mod funnel;
mod index;
mod models;
mod propensity;
mod report;
mod store;

#[derive(Parser)]
#[command(name = "activation-metrics")]
#[command(about = "Funnel, retention cohort, and activation propensity pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and publish all exports atomically
    Run {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 8)]
        max_offset: u32,
    },
    /// Print funnel step counts
    Funnel {
        #[arg(long)]
        input: PathBuf,
        /// Comma-separated step event names; defaults to the signup →
        /// project_shipped milestones
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<String>>,
    },
    /// Print the weekly retention matrix
    Cohorts {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 8)]
        max_offset: u32,
    },
    /// Rank unactivated users by activation propensity
    Score {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 8)]
        max_offset: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            out,
            max_offset,
        } => {
            let set = load(&input)?;
            let index = index::EventIndex::build(&set.events);
            let funnel_rows = funnel::compute_funnel(&index, &funnel::default_steps());
            let cohort_rows = cohort::compute_cohorts(
                &index,
                cohort::CohortParams {
                    window_days: 7,
                    max_offset,
                },
            );
            let feature_rows = features::build_features(&set.events, &index);
            let scored = propensity::fit_and_score(&feature_rows);

            let manifest = export::write_exports(
                &out,
                &funnel_rows,
                &cohort_rows,
                &feature_rows,
                &scored,
                &set.summary,
            )?;

            println!(
                "Exports published to {} (schema v{}).",
                out.display(),
                manifest.schema_version
            );
            println!(
                "Read {} events ({} invalid, {} duplicates dropped).",
                manifest.events_read, manifest.records_dropped, manifest.duplicates_dropped
            );
            match manifest.auc {
                Some(auc) => println!("Propensity model held-out AUC {auc:.3}."),
                None if manifest.model == "baseline" => {
                    println!("Propensity model degraded to baseline; see scores table.");
                }
                None => println!("Propensity model fit; AUC not available."),
            }
        }
        Commands::Funnel { input, steps } => {
            let set = load(&input)?;
            let index = index::EventIndex::build(&set.events);
            let steps = steps.unwrap_or_else(funnel::default_steps);
            let rows = funnel::compute_funnel(&index, &steps);

            println!("Funnel:");
            for row in rows {
                if row.zero_conversion {
                    println!(
                        "- {}: {} users (previous step empty)",
                        row.step, row.distinct_user_count
                    );
                } else {
                    println!(
                        "- {}: {} users ({:.1}% from previous)",
                        row.step,
                        row.distinct_user_count,
                        row.conversion_from_previous * 100.0
                    );
                }
            }
        }
        Commands::Cohorts { input, max_offset } => {
            let set = load(&input)?;
            let index = index::EventIndex::build(&set.events);
            let rows = cohort::compute_cohorts(
                &index,
                cohort::CohortParams {
                    window_days: 7,
                    max_offset,
                },
            );

            if rows.is_empty() {
                println!("No signup cohorts found.");
                return Ok(());
            }
            println!("Cohort retention:");
            for row in rows {
                match (row.retained_count, row.retained_rate) {
                    (Some(count), Some(rate)) => println!(
                        "- {} week {}: {:.1}% ({}/{})",
                        row.cohort_week,
                        row.week_offset,
                        rate * 100.0,
                        count,
                        row.cohort_size
                    ),
                    _ => println!(
                        "- {} week {}: pending ({} users)",
                        row.cohort_week, row.week_offset, row.cohort_size
                    ),
                }
            }
        }
        Commands::Score { input, limit } => {
            let set = load(&input)?;
            let index = index::EventIndex::build(&set.events);
            let feature_rows = features::build_features(&set.events, &index);
            let scored = propensity::fit_and_score(&feature_rows);

            if let propensity::ModelOutcome::Baseline { reason } = &scored.outcome {
                println!("Baseline scores only: {reason}.");
            }

            let targets = propensity::rank_targets(&feature_rows, &scored);
            if targets.is_empty() {
                println!("No unactivated users to target.");
                return Ok(());
            }
            println!("Top experiment targets:");
            for (user, score) in targets.iter().take(limit) {
                println!("- {user} score {score:.3}");
            }
        }
        Commands::Report {
            input,
            out,
            max_offset,
        } => {
            let set = load(&input)?;
            let index = index::EventIndex::build(&set.events);
            let funnel_rows = funnel::compute_funnel(&index, &funnel::default_steps());
            let cohort_rows = cohort::compute_cohorts(
                &index,
                cohort::CohortParams {
                    window_days: 7,
                    max_offset,
                },
            );
            let feature_rows = features::build_features(&set.events, &index);
            let scored = propensity::fit_and_score(&feature_rows);

            let report = report::build_report(&funnel_rows, &cohort_rows, &feature_rows, &scored);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write report to {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn load(input: &Path) -> anyhow::Result<store::EventSet> {
    let set = store::read_events(input)?;
    if set.summary.dropped_invalid > 0 || set.summary.dropped_duplicate > 0 {
        tracing::warn!(
            invalid = set.summary.dropped_invalid,
            duplicates = set.summary.dropped_duplicate,
            "dropped records while reading the event source"
        );
    }
    Ok(set)
}
