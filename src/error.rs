//! Error Taxonomy
//!
//! Shared error types for the pipeline engine. Preparation-phase errors
//! (input/output/script) are fatal to the whole run; runtime errors
//! (submission failures, non-zero exit codes) are recovered by the job
//! manager according to the process error policy.

use std::io;

use thiserror::Error;

use crate::template::TemplateError;

/// Errors raised by the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An input value could not be resolved (missing file, wrong shape).
    #[error("failed to parse input '{key}': {reason}")]
    InputParse { key: String, reason: String },

    /// An output expression rendered to something unusable.
    #[error("failed to parse output '{key}': {reason}")]
    OutputParse { key: String, reason: String },

    /// The template collaborator failed to render an expression.
    #[error("script render error: {0}")]
    ScriptRender(#[from] TemplateError),

    /// A backend rejected or lost a submission; carries its diagnostic.
    #[error("submission to {backend} runner failed: {diagnostic}")]
    SubmissionFailed { backend: String, diagnostic: String },

    /// Start/resume selection violates graph reachability.
    #[error("process relation error: {route}: {message}")]
    ProcRelation { route: String, message: String },

    /// A backend could not be constructed from the process configuration.
    #[error("runner error: {0}")]
    Runner(String),

    /// Input channel rows do not match the declared input schema.
    #[error("channel mismatch for process '{proc}': {reason}")]
    ChannelMismatch { proc: String, reason: String },

    /// One or more jobs of a process failed terminally.
    #[error("process '{proc}' failed: {failed} of {total} jobs did not succeed")]
    ProcessFailed {
        proc: String,
        failed: usize,
        total: usize,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Io(io::Error::new(io::ErrorKind::Other, err))
    }
}

impl PipelineError {
    /// Convenience constructor for input parse failures.
    pub fn input(key: &str, reason: impl Into<String>) -> Self {
        Self::InputParse {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for output parse failures.
    pub fn output(key: &str, reason: impl Into<String>) -> Self {
        Self::OutputParse {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
