//! Error types for the coordinator and the pipeline runner.
//!
//! [`ServiceError`] is what the API layer sees and maps onto HTTP statuses in
//! `server.rs`. [`PipelineError`] never leaves a worker: the runner turns it
//! into a `failed` summary.

use synopsis_core::models::SummaryStatus;
use synopsis_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The source was empty or whitespace only.
    #[error("source text is empty")]
    EmptySource,
    #[error("model '{model}' is not supported; available: {available}")]
    UnsupportedModel { model: String, available: String },
    #[error("language '{language}' is not supported; available: {available}")]
    UnsupportedLanguage { language: String, available: String },
    #[error("request id '{0}' is not a 64-character lowercase hex identity")]
    InvalidRequestId(String),
    #[error("no summary found for request {0}")]
    NotFound(String),
    #[error("job queue is closed")]
    QueueClosed,
    #[error("job queue is full; try again later")]
    QueueFull,
    #[error("language detection failed: {0}")]
    Detection(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A pipeline stage that could not complete.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed: {source:#}")]
    Stage {
        stage: SummaryStatus,
        #[source]
        source: anyhow::Error,
    },
    #[error("store error while {stage}: {source}")]
    Store {
        stage: SummaryStatus,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    pub fn stage(stage: SummaryStatus, source: anyhow::Error) -> Self {
        PipelineError::Stage { stage, source }
    }

    pub fn store(stage: SummaryStatus, source: StoreError) -> Self {
        PipelineError::Store { stage, source }
    }

    /// The status the summary was in when the error happened.
    pub fn failed_stage(&self) -> SummaryStatus {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::Store { stage, .. } => *stage,
        }
    }
}
