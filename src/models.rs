use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Version stamped into the export manifest; bumped on any column change.
pub const SCHEMA_VERSION: u32 = 1;

pub const SIGNUP: &str = "signup";
pub const FIRST_PROMPT: &str = "first_prompt";
pub const FIRST_OUTPUT: &str = "first_output";
pub const PROJECT_CREATED: &str = "project_created";
pub const PROJECT_SHIPPED: &str = "project_shipped";
pub const TEMPLATE_USED: &str = "template_used";

/// Event names treated as errors when counting early friction.
pub const ERROR_EVENTS: [&str; 2] = ["error", "error_hit"];

#[derive(Debug, Clone)]
pub struct Event {
    pub user_id: String,
    pub event_name: String,
    pub timestamp: NaiveDateTime,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FunnelRow {
    pub step: String,
    pub distinct_user_count: u64,
    pub conversion_from_previous: f64,
    pub zero_conversion: bool,
}

#[derive(Debug, Clone)]
pub struct CohortRow {
    pub cohort_week: String,
    pub week_offset: u32,
    pub cohort_size: u64,
    pub retained_count: Option<u64>,
    pub retained_rate: Option<f64>,
    pub observable: bool,
}

#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub user_id: String,
    pub cohort_week: String,
    pub time_to_first_output_min: Option<f64>,
    pub early_error_count: u32,
    pub latency_mean_ms: f64,
    pub latency_bucket: String,
    pub template_used: bool,
    pub activated_within_48h: bool,
    pub channel: String,
    pub platform: String,
    pub intent: String,
}

#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub user_id: String,
    pub score: f64,
    pub insufficient_data: bool,
}

/// Run manifest published alongside the tables. Carries no wall-clock
/// fields so identical inputs publish byte-identical exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub events_read: usize,
    pub records_dropped: usize,
    pub duplicates_dropped: usize,
    pub funnel_rows: usize,
    pub cohort_rows: usize,
    pub feature_rows: usize,
    pub score_rows: usize,
    pub model: String,
    pub auc: Option<f64>,
}
