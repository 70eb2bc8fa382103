//! Storage abstraction for summarization jobs.
//!
//! The [`Store`] trait holds the three record kinds of a job (sources,
//! summaries and requests) and exposes every operation the coordinator and
//! the pipeline runner need. Each operation is atomic with respect to every
//! other operation on the same store: in particular a re-key
//! ([`Store::update_source`]) is never observable half-done.
//!
//! Implementations must be `Send + Sync` to be shared across tasks.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`request_exists`](Store::request_exists) | Request lookup by id |
//! | [`summary_exists`](Store::summary_exists) | Summary lookup by id |
//! | [`source_exists`](Store::source_exists) | Source lookup by id |
//! | [`get_summary_by_request_id`](Store::get_summary_by_request_id) | Resolve a client handle |
//! | [`get_summary`](Store::get_summary) | Read a summary by its internal id |
//! | [`insert_initial_request`](Store::insert_initial_request) | Create source, summary and request, or attach |
//! | [`update_summary`](Store::update_summary) | Apply a [`SummaryPatch`] |
//! | [`update_source`](Store::update_source) | Re-key (or merge) a summary after preprocessing |
//! | [`increment_summary_count`](Store::increment_summary_count) | Bump a reference count |
//! | [`touch_request`](Store::touch_request) | Refresh a request's last access time |
//! | [`recover_unfinished`](Store::recover_unfinished) | Settle jobs a stopped process left behind |

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{NewSummary, Summary, SummaryPatch, SummaryStatus, Warnings};

/// Errors raised by [`Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend stayed locked by concurrent writers for every retry.
    #[error("store contention during {operation}: gave up after {attempts} attempts")]
    Contention {
        operation: &'static str,
        attempts: u32,
    },
    #[error("invalid status transition for summary {summary_id}: {from} -> {to}")]
    InvalidTransition {
        summary_id: String,
        from: SummaryStatus,
        to: SummaryStatus,
    },
    #[error("summary {summary_id} is {status} and can no longer be modified")]
    Finalized {
        summary_id: String,
        status: SummaryStatus,
    },
    #[error("request {0} already exists")]
    DuplicateRequest(String),
    #[error("summary {0} does not exist")]
    MissingSummary(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What [`Store::insert_initial_request`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new summary was created; its pipeline must be scheduled.
    Created,
    /// A summary with the same identity already existed; the request now
    /// points at it.
    Attached,
}

/// What [`Store::update_source`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyOutcome {
    /// The summary now lives under the new identity.
    Rekeyed,
    /// Another summary already had the new identity. Requests were moved
    /// onto it and the provisional summary was removed.
    Merged,
}

/// A summary that never got past `preprocessing` and can be run again from
/// the start.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumable {
    /// One of the requests pointing at the summary. The runner addresses
    /// the summary through it.
    pub request_id: String,
    pub summary: Summary,
}

/// Check that `patch` may be applied to a summary currently in `current`.
///
/// Terminal summaries are immutable, and status changes must follow
/// [`SummaryStatus::can_transition_to`]. Backends call this inside the
/// same critical section that applies the patch.
pub fn validate_patch(
    summary_id: &str,
    current: SummaryStatus,
    patch: &SummaryPatch,
) -> StoreResult<()> {
    if !patch.touches_summary() {
        return Ok(());
    }
    if current.is_terminal() {
        return Err(StoreError::Finalized {
            summary_id: summary_id.to_string(),
            status: current,
        });
    }
    if let Some(to) = patch.status {
        if !current.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                summary_id: summary_id.to_string(),
                from: current,
                to,
            });
        }
    }
    Ok(())
}

/// Abstract job store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn request_exists(&self, request_id: &str) -> StoreResult<bool>;

    async fn summary_exists(&self, summary_id: &str) -> StoreResult<bool>;

    async fn source_exists(&self, source_id: &str) -> StoreResult<bool>;

    /// Resolve a request to its summary and the request's warnings.
    ///
    /// Returns `None` when the request is unknown, and also when it points
    /// at a summary that does not exist. The latter is an internal
    /// inconsistency; implementations log it instead of failing.
    async fn get_summary_by_request_id(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<(Summary, Warnings)>>;

    async fn get_summary(&self, summary_id: &str) -> StoreResult<Option<Summary>>;

    /// Create the source, summary and request of a new submission.
    ///
    /// The summary starts in `preprocessing` with a reference count of 1.
    /// If a summary with `summary.id` already exists, only the request is
    /// created and the existing summary's count is incremented.
    async fn insert_initial_request(
        &self,
        request_id: &str,
        summary: &NewSummary,
        cache: bool,
        warnings: &Warnings,
    ) -> StoreResult<InsertOutcome>;

    /// Apply `patch` to the summary reached through `request_id`.
    ///
    /// `patch.warnings` is written to the request. A no-op when the request
    /// does not exist.
    async fn update_summary(&self, request_id: &str, patch: SummaryPatch) -> StoreResult<()>;

    /// Move a summary from `old_summary_id` to `new_summary_id`, redirecting
    /// every request that pointed at it, and re-key its source from the hash
    /// of `old_source` to the hash of `new_source`.
    async fn update_source(
        &self,
        old_source: &str,
        new_source: &str,
        old_summary_id: &str,
        new_summary_id: &str,
    ) -> StoreResult<RekeyOutcome>;

    /// Increment a summary's reference count. A no-op when it is absent.
    async fn increment_summary_count(&self, summary_id: &str) -> StoreResult<()>;

    /// Refresh a request's `last_accessed` timestamp.
    async fn touch_request(&self, request_id: &str) -> StoreResult<()>;

    /// Settle summaries whose pipeline died with the process that ran it.
    ///
    /// Summaries still in `preprocessing` have produced nothing yet and are
    /// returned so they can be queued again. Every other non-terminal
    /// summary is moved to `failed` with `message` and `ended_at`, since its
    /// stages cannot be replayed without moving its status backwards.
    async fn recover_unfinished(
        &self,
        message: &str,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Resumable>>;
}
