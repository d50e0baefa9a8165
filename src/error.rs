use std::path::PathBuf;

use thiserror::Error;

/// Fatal pipeline failures. Record-level problems are dropped and counted
/// in `store::ReadSummary` instead; insufficient label data degrades the
/// propensity model to a baseline (`propensity::ModelOutcome`) rather than
/// surfacing here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event source unavailable: {path}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("failed to write export {path}")]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode export {path}")]
    ExportEncode {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
