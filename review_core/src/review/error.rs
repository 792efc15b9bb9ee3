//! One `thiserror` enum per layer, composed into a top-level [`PipelineError`]
//! at the orchestration boundary. Only [`PipelineError::Input`] and
//! [`PipelineError::Vcs`] ever abort a run (see spec §7); every other error
//! variant here is caught at its own layer and degraded into a partial
//! result plus a `tracing` event.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("no diff detected for mode {0}")]
    NoDiffDetected(String),

    #[error("unsupported diff mode: {0}")]
    BadMode(String),

    #[error("commit mode requires commit_from")]
    MissingCommitFrom,

    #[error("unable to detect base branch (main/master not found)")]
    NoBaseBranch,

    #[error("git command failed ({command}): {stderr}")]
    Vcs { command: String, stderr: String },

    #[error("current directory is not a git repository: {0}")]
    NotARepository(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("learned rule store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("learned rule store json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("planner response was not valid JSON: {0}")]
    MalformedPlannerResponse(String),
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("conflict store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conflict record json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("scanner {0} unavailable: {1}")]
    Unavailable(String, String),

    #[error("scanner {scanner} failed on {file}: {message}")]
    Runtime {
        scanner: String,
        file: String,
        message: String,
    },

    #[error("scanner {0} timed out after {1}s")]
    Timeout(String, u64),

    #[error("no cached static-scan results for session {0}")]
    LinkedResultsNotFound(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session operation failed: {0}")]
    OperationFailed(String),

    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The only two variants that can legitimately abort a `Pipeline::run`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(#[source] DiffError),

    #[error("vcs error: {0}")]
    Vcs(#[source] DiffError),
}

impl PipelineError {
    pub fn from_diff_error(err: DiffError) -> Self {
        match &err {
            DiffError::Vcs { .. } => PipelineError::Vcs(err),
            _ => PipelineError::Input(err),
        }
    }
}
