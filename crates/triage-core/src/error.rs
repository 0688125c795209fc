//! Error taxonomy for stages, pipelines and optimization runs

use thiserror::Error;

/// Failure of the external generation primitive
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(String),
    #[error("generation API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("generation call timed out")]
    Timeout,
    /// The primitive answered but its output could not be read as fields
    #[error("malformed generation output: {0}")]
    Malformed(String),
}

/// Failure of the external retrieval primitive
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("retrieval failed: {0}")]
    Backend(String),
    #[error("retrieval call timed out")]
    Timeout,
}

#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The primitive's response could not be parsed into the declared output fields
    #[error("schema mismatch in stage '{stage}': {detail}")]
    SchemaMismatch { stage: String, detail: String },
    /// The primitive could not be reached (after any caller-side retries)
    #[error("upstream unavailable for stage '{stage}' after {attempts} attempt(s): {detail}")]
    UpstreamUnavailable {
        stage: String,
        attempts: u32,
        detail: String,
    },
    /// The stage was handed input that does not satisfy its input schema
    #[error("invalid input for stage '{stage}': {detail}")]
    InvalidInput { stage: String, detail: String },
}

impl StageError {
    /// Whether a caller retry policy may try the call again
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::UpstreamUnavailable { .. })
    }

    pub fn stage(&self) -> &str {
        match self {
            StageError::SchemaMismatch { stage, .. }
            | StageError::UpstreamUnavailable { stage, .. }
            | StageError::InvalidInput { stage, .. } => stage,
        }
    }

    pub(crate) fn with_attempts(self, total: u32) -> Self {
        match self {
            StageError::UpstreamUnavailable { stage, detail, .. } => {
                StageError::UpstreamUnavailable {
                    stage,
                    attempts: total,
                    detail,
                }
            }
            other => other,
        }
    }
}

/// A stage failure surfaced by the pipeline, tagged with the originating stage
#[derive(Debug, Clone, Error)]
#[error("pipeline failed at stage '{stage}': {source}")]
pub struct PipelineError {
    pub stage: String,
    #[source]
    pub source: StageError,
}

impl From<StageError> for PipelineError {
    fn from(source: StageError) -> Self {
        Self {
            stage: source.stage().to_string(),
            source,
        }
    }
}

/// A validation-pool example reached demonstration content
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LeakError {
    #[error("validation leak: example '{example_id}' used as a demonstration for stage '{stage}'")]
    Demonstration { example_id: String, stage: String },
    #[error("validation leak: example '{0}' is present in both pools")]
    SharedIdentifier(String),
    #[error("example identifier '{0}' appears more than once")]
    DuplicateIdentifier(String),
}

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    ValidationLeak(#[from] LeakError),
    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(String),
    #[error("pipeline state does not match pipeline stages: {0}")]
    StateMismatch(String),
    #[error("optimization task failed: {0}")]
    Task(String),
}
