//! Core data models shared by the store, the pipeline and the API layer.
//!
//! Three record kinds make up a job: a [`Source`] (the original text), a
//! [`Summary`] (the unit of processed work, deduplicated by content) and a
//! [`Request`] (the client handle that points at a summary).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::summary_identity;

/// Effective processing parameters, keyed by option name.
///
/// A `BTreeMap` keeps keys sorted, so the JSON serialization used for
/// hashing is canonical regardless of the order a client sent them in.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Warnings raised while validating a request, keyed by option name.
pub type Warnings = BTreeMap<String, Vec<String>>;

/// Append a warning message under `key`.
pub fn add_warning(warnings: &mut Warnings, key: &str, message: impl Into<String>) {
    warnings
        .entry(key.to_string())
        .or_default()
        .push(message.into());
}

/// Processing status of a [`Summary`].
///
/// The non-terminal statuses form a strict forward chain:
/// `preprocessing → encoding → summarizing → postprocessing → completed`.
/// `failed` may be entered from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Preprocessing,
    Encoding,
    Summarizing,
    Postprocessing,
    Completed,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Preprocessing => "preprocessing",
            SummaryStatus::Encoding => "encoding",
            SummaryStatus::Summarizing => "summarizing",
            SummaryStatus::Postprocessing => "postprocessing",
            SummaryStatus::Completed => "completed",
            SummaryStatus::Failed => "failed",
        }
    }

    /// The status that follows this one on the success path.
    pub fn next(self) -> Option<SummaryStatus> {
        match self {
            SummaryStatus::Preprocessing => Some(SummaryStatus::Encoding),
            SummaryStatus::Encoding => Some(SummaryStatus::Summarizing),
            SummaryStatus::Summarizing => Some(SummaryStatus::Postprocessing),
            SummaryStatus::Postprocessing => Some(SummaryStatus::Completed),
            SummaryStatus::Completed | SummaryStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SummaryStatus::Completed | SummaryStatus::Failed)
    }

    /// Position on the success path; `failed` sorts after everything.
    pub fn rank(self) -> u8 {
        match self {
            SummaryStatus::Preprocessing => 0,
            SummaryStatus::Encoding => 1,
            SummaryStatus::Summarizing => 2,
            SummaryStatus::Postprocessing => 3,
            SummaryStatus::Completed => 4,
            SummaryStatus::Failed => 5,
        }
    }

    /// Whether moving from `self` to `to` respects monotonicity.
    ///
    /// Rewriting the current non-terminal status is accepted as a no-op.
    pub fn can_transition_to(self, to: SummaryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == self || self.next() == Some(to) || to == SummaryStatus::Failed
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprocessing" => Ok(SummaryStatus::Preprocessing),
            "encoding" => Ok(SummaryStatus::Encoding),
            "summarizing" => Ok(SummaryStatus::Summarizing),
            "postprocessing" => Ok(SummaryStatus::Postprocessing),
            "completed" => Ok(SummaryStatus::Completed),
            "failed" => Ok(SummaryStatus::Failed),
            other => Err(format!("unknown summary status: '{}'", other)),
        }
    }
}

/// Immutable original input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub content: String,
    pub content_length: usize,
}

/// Everything needed to create the initial summary of a submission.
#[derive(Debug, Clone)]
pub struct NewSummary {
    /// Provisional identity, hashed over the raw source.
    pub id: String,
    pub source: String,
    pub model: String,
    pub params: Params,
    pub language: String,
    pub started_at: DateTime<Utc>,
}

impl NewSummary {
    pub fn new(source: &str, model: &str, params: Params, language: &str) -> Self {
        Self {
            id: summary_identity(source, model, &params),
            source: source.to_string(),
            model: model.to_string(),
            params,
            language: language.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// A summary as read back from the store, joined with its source text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub id: String,
    pub source_id: String,
    pub source: String,
    pub output: Option<String>,
    pub output_length: Option<usize>,
    pub model: String,
    pub params: Params,
    pub status: SummaryStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub language: String,
    pub request_count: u32,
}

/// A client-facing handle onto a summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub summary_id: String,
    pub cache: bool,
    pub last_accessed: DateTime<Utc>,
    pub warnings: Warnings,
}

/// Partial update of a summary reached through a request.
///
/// Only `Some` fields are written. `warnings` belongs to the request record,
/// every other field to the summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryPatch {
    pub output: Option<String>,
    pub output_length: Option<usize>,
    pub params: Option<Params>,
    pub status: Option<SummaryStatus>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub warnings: Option<Warnings>,
}

impl SummaryPatch {
    pub fn status(status: SummaryStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Final transition: output, its length in characters and the end time.
    pub fn completed(output: String, ended_at: DateTime<Utc>) -> Self {
        Self {
            output_length: Some(output.chars().count()),
            output: Some(output),
            status: Some(SummaryStatus::Completed),
            ended_at: Some(ended_at),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(SummaryStatus::Failed),
            error: Some(message.into()),
            ended_at: Some(ended_at),
            ..Default::default()
        }
    }

    pub fn with_warnings(mut self, warnings: Warnings) -> Self {
        self.warnings = Some(warnings);
        self
    }

    /// True when the patch writes at least one summary field.
    pub fn touches_summary(&self) -> bool {
        self.output.is_some()
            || self.output_length.is_some()
            || self.params.is_some()
            || self.status.is_some()
            || self.error.is_some()
            || self.started_at.is_some()
            || self.ended_at.is_some()
    }
}

/// Result of language detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLanguage {
    /// ISO 639-1 code, e.g. `"en"`.
    pub language: String,
    /// Confidence in `[0.0, 1.0]`, rounded to two decimals.
    pub confidence: f64,
}
