//! Failure kinds surfaced by the pipeline.

use thiserror::Error;

/// Errors with a meaning to the pipeline controller. Everything else travels
/// as a plain `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration or insufficient replicates; raised before any work starts.
    #[error("invalid configuration: {0}")]
    Precondition(String),

    /// An upstream artifact is missing; aborts only the current unit.
    #[error("sample {sample} is not ready: alignment {bam} does not exist")]
    InputNotReady { sample: String, bam: String },

    /// An external command did not exit with status zero.
    #[error("{what} failed with {}", describe_exit(.code))]
    Subprocess { what: String, code: Option<i32> },

    /// One pairwise comparison failed; counted as zero passing peaks.
    #[error("comparison {0} failed, counting zero passing peaks")]
    SoftComparison(String),

    /// A checkpoint was requested without an output directory.
    #[error("no output directory given for the checkpoint of {0}")]
    MissingOutputDir(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "termination by signal".to_string(),
    }
}
