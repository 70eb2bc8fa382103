//! Summarization pipeline runner.
//!
//! A [`PipelineRunner`] drives one summary through its stages:
//!
//! ```text
//! preprocessing ─▶ encoding ─▶ summarizing ─▶ postprocessing ─▶ completed
//!       │              │             │               │
//!       └──────────────┴─────────────┴───────────────┴──────▶ failed
//! ```
//!
//! Every status write is awaited before the next stage starts, so a poll
//! never observes a stage that has not been persisted. The runner addresses
//! the summary through the request id, which stays valid when preprocessing
//! re-keys the summary.
//!
//! If preprocessing reveals that an equivalent summary already exists, the
//! store merges the two and the runner stops early.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use synopsis_core::capability::{Encoder, Postprocessor, Preprocessor, Summarizer};
use synopsis_core::identity::summary_identity;
use synopsis_core::models::{Params, SummaryPatch, SummaryStatus};
use synopsis_core::store::{RekeyOutcome, Resumable, Store};

use crate::error::PipelineError;
use crate::text::{ChunkEncoder, ExtractiveSummarizer, SentencePostprocessor, WhitespacePreprocessor};

/// The stage implementations a runner calls.
#[derive(Clone)]
pub struct Capabilities {
    pub preprocessor: Arc<dyn Preprocessor>,
    pub encoder: Arc<dyn Encoder>,
    pub summarizer: Arc<dyn Summarizer>,
    pub postprocessor: Arc<dyn Postprocessor>,
}

impl Capabilities {
    /// The built-in text processors from [`crate::text`].
    pub fn builtin(max_chunk_tokens: usize) -> Self {
        Self {
            preprocessor: Arc::new(WhitespacePreprocessor),
            encoder: Arc::new(ChunkEncoder::new(max_chunk_tokens)),
            summarizer: Arc::new(ExtractiveSummarizer),
            postprocessor: Arc::new(SentencePostprocessor),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }
}

/// One unit of pipeline work: the request that created a summary, plus the
/// inputs its provisional identity was computed from.
#[derive(Debug, Clone)]
pub struct Job {
    pub request_id: String,
    pub source: String,
    pub model: String,
    pub params: Params,
}

impl From<Resumable> for Job {
    /// Rerun a summary left in `preprocessing`. Its stored source hashes to
    /// its current id whether or not it was already re-keyed, so the runner
    /// picks it up unchanged.
    fn from(resumable: Resumable) -> Self {
        Self {
            request_id: resumable.request_id,
            source: resumable.summary.source,
            model: resumable.summary.model,
            params: resumable.summary.params,
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Folded into an equivalent, already existing summary.
    Merged,
    Failed,
}

pub struct PipelineRunner {
    store: Arc<dyn Store>,
    caps: Capabilities,
}

impl PipelineRunner {
    pub fn new(store: Arc<dyn Store>, caps: Capabilities) -> Self {
        Self { store, caps }
    }

    /// Run every stage for `job`. Stage failures are persisted as a
    /// `failed` summary; this never returns an error.
    pub async fn run(&self, job: &Job) -> RunOutcome {
        match self.run_stages(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    request_id = %job.request_id,
                    stage = %e.failed_stage(),
                    error = %e,
                    "pipeline failed"
                );
                let patch = SummaryPatch::failed(e.to_string(), Utc::now());
                if let Err(store_err) = self.store.update_summary(&job.request_id, patch).await {
                    error!(
                        request_id = %job.request_id,
                        error = %store_err,
                        "could not record pipeline failure"
                    );
                }
                RunOutcome::Failed
            }
        }
    }

    async fn run_stages(&self, job: &Job) -> Result<RunOutcome, PipelineError> {
        let request_id = job.request_id.as_str();

        debug!(request_id, "preprocessing");
        let stage = SummaryStatus::Preprocessing;
        let clean = self
            .caps
            .preprocessor
            .preprocess(&job.source)
            .await
            .map_err(|e| PipelineError::stage(stage, e))?;
        if clean.trim().is_empty() {
            return Err(PipelineError::stage(
                stage,
                anyhow::anyhow!("preprocessing produced empty text"),
            ));
        }

        let old_id = summary_identity(&job.source, &job.model, &job.params);
        let new_id = summary_identity(&clean, &job.model, &job.params);
        let rekey = self
            .store
            .update_source(&job.source, &clean, &old_id, &new_id)
            .await
            .map_err(|e| PipelineError::store(stage, e))?;
        if rekey == RekeyOutcome::Merged {
            info!(request_id, summary_id = %new_id, "merged into existing summary");
            return Ok(RunOutcome::Merged);
        }

        self.advance(request_id, SummaryStatus::Encoding).await?;
        let encoded = self
            .caps
            .encoder
            .encode(&clean)
            .await
            .map_err(|e| PipelineError::stage(SummaryStatus::Encoding, e))?;
        debug!(request_id, chunks = encoded.chunks.len(), "encoded");

        self.advance(request_id, SummaryStatus::Summarizing).await?;
        let raw = self
            .caps
            .summarizer
            .summarize(&encoded, &job.params)
            .await
            .map_err(|e| PipelineError::stage(SummaryStatus::Summarizing, e))?;

        self.advance(request_id, SummaryStatus::Postprocessing).await?;
        let output = self
            .caps
            .postprocessor
            .postprocess(&raw)
            .await
            .map_err(|e| PipelineError::stage(SummaryStatus::Postprocessing, e))?;

        let output_length = output.chars().count();
        self.store
            .update_summary(request_id, SummaryPatch::completed(output, Utc::now()))
            .await
            .map_err(|e| PipelineError::store(SummaryStatus::Postprocessing, e))?;
        info!(request_id, summary_id = %new_id, output_length, "summary completed");
        Ok(RunOutcome::Completed)
    }

    async fn advance(&self, request_id: &str, to: SummaryStatus) -> Result<(), PipelineError> {
        debug!(request_id, status = %to, "advancing");
        self.store
            .update_summary(request_id, SummaryPatch::status(to))
            .await
            .map_err(|e| PipelineError::store(to, e))
    }
}
