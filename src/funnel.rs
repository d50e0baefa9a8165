use crate::index::EventIndex;
use crate::models::{
    FunnelRow, FIRST_OUTPUT, FIRST_PROMPT, PROJECT_CREATED, PROJECT_SHIPPED, SIGNUP,
};

pub const DEFAULT_STEPS: [&str; 5] = [
    SIGNUP,
    FIRST_PROMPT,
    FIRST_OUTPUT,
    PROJECT_CREATED,
    PROJECT_SHIPPED,
];

/// Counts are marginal per-step distinct users: a user counts at step i
/// whenever they have that event, whether or not step i-1 ever happened.
pub fn compute_funnel(index: &EventIndex, steps: &[String]) -> Vec<FunnelRow> {
    let mut rows = Vec::with_capacity(steps.len());
    let mut previous: Option<u64> = None;

    for step in steps {
        let count = index.distinct_user_count(step);
        let (conversion, zero_conversion) = match previous {
            None => (1.0, false),
            Some(0) => (0.0, true),
            Some(prev) => (count as f64 / prev as f64, false),
        };

        rows.push(FunnelRow {
            step: step.clone(),
            distinct_user_count: count,
            conversion_from_previous: conversion,
            zero_conversion,
        });
        previous = Some(count);
    }

    rows
}

pub fn default_steps() -> Vec<String> {
    DEFAULT_STEPS.iter().map(|s| s.to_string()).collect()
}
