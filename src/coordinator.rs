//! Request coordinator: the entry point the API layer calls.
//!
//! [`Coordinator::submit`] validates a submission, computes identities and
//! either attaches the request to existing work or creates a new summary and
//! queues its pipeline. [`Coordinator::fetch`] resolves a request id to the
//! current state of its summary. Neither ever waits on a running pipeline.
//!
//! Jobs live only in this process's queue. A summary that was mid-pipeline
//! when a previous process stopped is settled once, before this coordinator
//! queues anything: see [`Coordinator::recover`]. Only one process running
//! pipelines should use a given database at a time.
//!
//! Clients only ever see request ids: the `id` of every returned
//! [`Summary`] is overwritten with the id of the request it was reached
//! through.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use synopsis_core::capability::LanguageDetector;
use synopsis_core::identity::{is_identity, request_identity};
use synopsis_core::models::{
    add_warning, DetectedLanguage, NewSummary, Params, Summary, SummaryPatch, Warnings,
};
use synopsis_core::params::validate_params;
use synopsis_core::store::memory::InMemoryStore;
use synopsis_core::store::{InsertOutcome, Store, StoreError};

use crate::config::{Config, StoreBackend, SummariesConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{Capabilities, Job, PipelineRunner};
use crate::queue::JobQueue;
use crate::sqlite_store::SqliteStore;

/// Error recorded on summaries whose pipeline died with a previous process.
pub const INTERRUPTED: &str =
    "interrupted: the process running this summary stopped before it finished";

/// A summarization request as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub source: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Replay key. Resubmitting with the id of an existing request returns
    /// that request unchanged.
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_cache() -> bool {
    true
}

impl Submission {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            model: None,
            params: Params::new(),
            language: None,
            cache: true,
            request_id: None,
        }
    }
}

/// Open the store selected by `[store] backend`.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            info!(path = %config.db.path.display(), "using SQLite store");
            Ok(Arc::new(SqliteStore::open(config).await?))
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    queue: JobQueue,
    detector: Arc<dyn LanguageDetector>,
    settings: SummariesConfig,
    recovered: OnceCell<()>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JobQueue,
        detector: Arc<dyn LanguageDetector>,
        settings: SummariesConfig,
    ) -> Self {
        Self {
            store,
            queue,
            detector,
            settings,
            recovered: OnceCell::new(),
        }
    }

    /// Wire a runner, a job queue and a coordinator around `store`.
    ///
    /// The returned handle is the queue dispatcher; it finishes once the
    /// coordinator is dropped and running pipelines are done.
    pub fn start(
        config: &Config,
        store: Arc<dyn Store>,
        caps: Capabilities,
        detector: Arc<dyn LanguageDetector>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let runner = Arc::new(PipelineRunner::new(store.clone(), caps));
        let (queue, dispatcher) = JobQueue::spawn(
            runner,
            config.pipeline.workers,
            config.pipeline.queue_capacity,
            config.pipeline.overflow_capacity,
        );
        let coordinator = Self::new(store, queue, detector, config.summaries.clone());
        (Arc::new(coordinator), dispatcher)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Settle work left behind by a previous process. Summaries that never
    /// left `preprocessing` are queued again; the rest are marked `failed`
    /// with [`INTERRUPTED`]. Runs at most once per coordinator and always
    /// before the first submission is queued.
    pub async fn recover(&self) -> ServiceResult<()> {
        self.recovered
            .get_or_try_init(|| async {
                let resumable = self.store.recover_unfinished(INTERRUPTED, Utc::now()).await?;
                if !resumable.is_empty() {
                    info!(count = resumable.len(), "requeueing interrupted summaries");
                }
                for job in resumable {
                    let request_id = job.request_id.clone();
                    // `schedule` has already failed a refused job.
                    if let Err(e) = self.schedule(&request_id, Job::from(job)).await {
                        warn!(request_id = %request_id, error = %e, "could not requeue interrupted summary");
                    }
                }
                Ok::<(), ServiceError>(())
            })
            .await?;
        Ok(())
    }

    /// Accept a submission. Returns the summary as it stands right after
    /// insertion, plus the warnings raised while validating it.
    pub async fn submit(&self, submission: Submission) -> ServiceResult<(Summary, Warnings)> {
        if submission.source.trim().is_empty() {
            return Err(ServiceError::EmptySource);
        }
        self.recover().await?;

        let model = submission
            .model
            .clone()
            .unwrap_or_else(|| self.settings.default_model.clone());
        if !self.settings.supports_model(&model) {
            return Err(ServiceError::UnsupportedModel {
                model,
                available: self.settings.models.join(", "),
            });
        }

        let language = self
            .resolve_language(submission.language.as_deref(), &submission.source)
            .await?;

        let validated = validate_params(&submission.params);
        let params = validated.params;
        let mut warnings = validated.warnings;
        let words = submission.source.split_whitespace().count();
        if words < self.settings.min_words_source {
            add_warning(
                &mut warnings,
                "source",
                format!(
                    "source has {} words; texts shorter than {} words may not summarize well",
                    words, self.settings.min_words_source
                ),
            );
        }

        let request_id = match submission.request_id {
            Some(id) if is_identity(&id) => id,
            Some(id) => return Err(ServiceError::InvalidRequestId(id)),
            None => request_identity(&submission.source, &model, &params),
        };

        if self.store.request_exists(&request_id).await? {
            debug!(request_id = %request_id, "replayed request");
            return self.replay(&request_id).await;
        }

        let new_summary = NewSummary::new(&submission.source, &model, params, &language);
        let outcome = match self
            .store
            .insert_initial_request(&request_id, &new_summary, submission.cache, &warnings)
            .await
        {
            Ok(outcome) => outcome,
            // Another submission with the same replay key won the race.
            Err(StoreError::DuplicateRequest(_)) => return self.replay(&request_id).await,
            Err(e) => return Err(e.into()),
        };

        let Some((mut summary, stored_warnings)) =
            self.store.get_summary_by_request_id(&request_id).await?
        else {
            return Err(ServiceError::NotFound(request_id));
        };

        match outcome {
            InsertOutcome::Created => {
                info!(
                    request_id = %request_id,
                    summary_id = %new_summary.id,
                    model = %model,
                    "new summary queued"
                );
                self.schedule(
                    &request_id,
                    Job {
                        request_id: request_id.clone(),
                        source: new_summary.source,
                        model,
                        params: new_summary.params,
                    },
                )
                .await?;
            }
            InsertOutcome::Attached => {
                info!(
                    request_id = %request_id,
                    summary_id = %summary.id,
                    status = %summary.status,
                    "attached to existing summary"
                );
            }
        }

        summary.id = request_id;
        Ok((summary, stored_warnings))
    }

    /// Current state of the summary behind `request_id`.
    pub async fn fetch(&self, request_id: &str) -> ServiceResult<Option<(Summary, Warnings)>> {
        self.store.touch_request(request_id).await?;
        let found = self.store.get_summary_by_request_id(request_id).await?;
        Ok(found.map(|(mut summary, warnings)| {
            summary.id = request_id.to_string();
            (summary, warnings)
        }))
    }

    /// Detect the language of `text`; `None` for empty input.
    pub async fn detect_language(&self, text: &str) -> ServiceResult<Option<DetectedLanguage>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.detector
            .detect(text)
            .await
            .map(Some)
            .map_err(|e| ServiceError::Detection(format!("{:#}", e)))
    }

    /// Queue a pipeline. A job that cannot be queued would leave its
    /// summary unfinished forever, so the summary is failed instead.
    async fn schedule(&self, request_id: &str, job: Job) -> ServiceResult<()> {
        let Err(e) = self.queue.enqueue(job) else {
            return Ok(());
        };
        let patch = SummaryPatch::failed(format!("not scheduled: {}", e), Utc::now());
        if let Err(store_err) = self.store.update_summary(request_id, patch).await {
            error!(request_id, error = %store_err, "could not fail unscheduled summary");
        }
        Err(e)
    }

    async fn replay(&self, request_id: &str) -> ServiceResult<(Summary, Warnings)> {
        self.fetch(request_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(request_id.to_string()))
    }

    /// A declared language must be supported. Otherwise the detected one is
    /// used when detection is confident, and the default language when not.
    async fn resolve_language(&self, declared: Option<&str>, source: &str) -> ServiceResult<String> {
        let language = match declared {
            Some(lang) => lang.to_lowercase(),
            None => match self.detector.detect(source).await {
                Ok(found) if found.confidence >= self.settings.language_confidence_threshold => {
                    found.language
                }
                Ok(found) => {
                    debug!(
                        language = %found.language,
                        confidence = found.confidence,
                        "low-confidence detection, using default language"
                    );
                    self.settings.default_language().to_string()
                }
                Err(e) => {
                    warn!(error = %e, "language detection failed, using default language");
                    self.settings.default_language().to_string()
                }
            },
        };

        if !self.settings.supports_language(&language) {
            return Err(ServiceError::UnsupportedLanguage {
                language,
                available: self.settings.supported_languages.join(", "),
            });
        }
        Ok(language)
    }
}
