//! In-memory [`Store`] implementation.
//!
//! All three tables live behind a single `std::sync::RwLock`, so every
//! operation, re-keying included, is one critical section. Nothing is
//! persisted; this backend is meant for tests and for single-process
//! deployments where losing jobs on restart is acceptable.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::identity::source_identity;
use crate::models::{
    NewSummary, Params, Request, Source, Summary, SummaryPatch, SummaryStatus, Warnings,
};

use super::{
    validate_patch, InsertOutcome, RekeyOutcome, Resumable, Store, StoreError, StoreResult,
};

struct SummaryRow {
    source_id: String,
    output: Option<String>,
    output_length: Option<usize>,
    model: String,
    params: Params,
    status: SummaryStatus,
    error: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    language: String,
    request_count: u32,
}

#[derive(Default)]
struct Tables {
    sources: HashMap<String, Source>,
    summaries: HashMap<String, SummaryRow>,
    requests: HashMap<String, Request>,
}

impl Tables {
    fn view(&self, summary_id: &str) -> Option<Summary> {
        let row = self.summaries.get(summary_id)?;
        let source = self
            .sources
            .get(&row.source_id)
            .map(|s| s.content.clone())
            .unwrap_or_default();
        Some(Summary {
            id: summary_id.to_string(),
            source_id: row.source_id.clone(),
            source,
            output: row.output.clone(),
            output_length: row.output_length,
            model: row.model.clone(),
            params: row.params.clone(),
            status: row.status,
            error: row.error.clone(),
            started_at: row.started_at,
            ended_at: row.ended_at,
            language: row.language.clone(),
            request_count: row.request_count,
        })
    }

    fn increment(&mut self, summary_id: &str) {
        if let Some(row) = self.summaries.get_mut(summary_id) {
            row.request_count += 1;
        }
    }

    /// Point every request at `from` to `to`; returns how many moved.
    fn redirect_requests(&mut self, from: &str, to: &str) -> u32 {
        let mut moved = 0;
        for request in self.requests.values_mut() {
            if request.summary_id == from {
                request.summary_id = to.to_string();
                moved += 1;
            }
        }
        moved
    }

    /// Drop a source nobody references any more.
    fn release_source(&mut self, source_id: &str) {
        if !self.summaries.values().any(|s| s.source_id == source_id) {
            self.sources.remove(source_id);
        }
    }

    fn ensure_source(&mut self, text: &str) -> String {
        let id = source_identity(text);
        self.sources.entry(id.clone()).or_insert_with(|| Source {
            id: id.clone(),
            content: text.to_string(),
            content_length: text.chars().count(),
        });
        id
    }
}

/// In-memory job store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a request record, for inspection in tests and the CLI.
    pub fn request(&self, request_id: &str) -> StoreResult<Option<Request>> {
        Ok(self.read()?.requests.get(request_id).cloned())
    }

    /// Number of requests currently pointing at `summary_id`.
    pub fn live_requests(&self, summary_id: &str) -> StoreResult<usize> {
        Ok(self
            .read()?
            .requests
            .values()
            .filter(|r| r.summary_id == summary_id)
            .count())
    }

    pub fn summary_count(&self) -> StoreResult<usize> {
        Ok(self.read()?.summaries.len())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn request_exists(&self, request_id: &str) -> StoreResult<bool> {
        Ok(self.read()?.requests.contains_key(request_id))
    }

    async fn summary_exists(&self, summary_id: &str) -> StoreResult<bool> {
        Ok(self.read()?.summaries.contains_key(summary_id))
    }

    async fn source_exists(&self, source_id: &str) -> StoreResult<bool> {
        Ok(self.read()?.sources.contains_key(source_id))
    }

    async fn get_summary_by_request_id(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<(Summary, Warnings)>> {
        let tables = self.read()?;
        let Some(request) = tables.requests.get(request_id) else {
            return Ok(None);
        };
        match tables.view(&request.summary_id) {
            Some(summary) => Ok(Some((summary, request.warnings.clone()))),
            None => {
                warn!(
                    request_id,
                    summary_id = %request.summary_id,
                    "request points at a missing summary"
                );
                Ok(None)
            }
        }
    }

    async fn get_summary(&self, summary_id: &str) -> StoreResult<Option<Summary>> {
        Ok(self.read()?.view(summary_id))
    }

    async fn insert_initial_request(
        &self,
        request_id: &str,
        summary: &NewSummary,
        cache: bool,
        warnings: &Warnings,
    ) -> StoreResult<InsertOutcome> {
        let mut tables = self.write()?;
        if tables.requests.contains_key(request_id) {
            return Err(StoreError::DuplicateRequest(request_id.to_string()));
        }

        let request = Request {
            id: request_id.to_string(),
            summary_id: summary.id.clone(),
            cache,
            last_accessed: Utc::now(),
            warnings: warnings.clone(),
        };

        if tables.summaries.contains_key(&summary.id) {
            tables.requests.insert(request_id.to_string(), request);
            tables.increment(&summary.id);
            return Ok(InsertOutcome::Attached);
        }

        let source_id = tables.ensure_source(&summary.source);
        tables.summaries.insert(
            summary.id.clone(),
            SummaryRow {
                source_id,
                output: None,
                output_length: None,
                model: summary.model.clone(),
                params: summary.params.clone(),
                status: SummaryStatus::Preprocessing,
                error: None,
                started_at: summary.started_at,
                ended_at: None,
                language: summary.language.clone(),
                request_count: 1,
            },
        );
        tables.requests.insert(request_id.to_string(), request);
        Ok(InsertOutcome::Created)
    }

    async fn update_summary(&self, request_id: &str, patch: SummaryPatch) -> StoreResult<()> {
        let mut guard = self.write()?;
        let Tables {
            summaries,
            requests,
            ..
        } = &mut *guard;

        let Some(request) = requests.get_mut(request_id) else {
            return Ok(());
        };

        if patch.touches_summary() {
            let Some(row) = summaries.get_mut(&request.summary_id) else {
                warn!(
                    request_id,
                    summary_id = %request.summary_id,
                    "update for a request whose summary is missing"
                );
                return Ok(());
            };
            validate_patch(&request.summary_id, row.status, &patch)?;

            if let Some(output) = patch.output {
                row.output = Some(output);
            }
            if let Some(len) = patch.output_length {
                row.output_length = Some(len);
            }
            if let Some(params) = patch.params {
                row.params = params;
            }
            if let Some(status) = patch.status {
                row.status = status;
            }
            if let Some(error) = patch.error {
                row.error = Some(error);
            }
            if let Some(started_at) = patch.started_at {
                row.started_at = started_at;
            }
            if let Some(ended_at) = patch.ended_at {
                row.ended_at = Some(ended_at);
            }
        }

        if let Some(warnings) = patch.warnings {
            request.warnings = warnings;
        }
        Ok(())
    }

    async fn update_source(
        &self,
        old_source: &str,
        new_source: &str,
        old_summary_id: &str,
        new_summary_id: &str,
    ) -> StoreResult<RekeyOutcome> {
        let mut tables = self.write()?;
        let old_source_id = source_identity(old_source);

        if old_summary_id == new_summary_id {
            return if tables.summaries.contains_key(old_summary_id) {
                Ok(RekeyOutcome::Rekeyed)
            } else {
                Err(StoreError::MissingSummary(old_summary_id.to_string()))
            };
        }

        let Some(mut row) = tables.summaries.remove(old_summary_id) else {
            return Err(StoreError::MissingSummary(old_summary_id.to_string()));
        };

        if tables.summaries.contains_key(new_summary_id) {
            let moved = tables.redirect_requests(old_summary_id, new_summary_id);
            if let Some(target) = tables.summaries.get_mut(new_summary_id) {
                target.request_count += moved;
            }
            tables.release_source(&old_source_id);
            return Ok(RekeyOutcome::Merged);
        }

        tables.redirect_requests(old_summary_id, new_summary_id);
        row.source_id = tables.ensure_source(new_source);
        tables.summaries.insert(new_summary_id.to_string(), row);
        if source_identity(new_source) != old_source_id {
            tables.release_source(&old_source_id);
        }
        Ok(RekeyOutcome::Rekeyed)
    }

    async fn increment_summary_count(&self, summary_id: &str) -> StoreResult<()> {
        self.write()?.increment(summary_id);
        Ok(())
    }

    async fn touch_request(&self, request_id: &str) -> StoreResult<()> {
        if let Some(request) = self.write()?.requests.get_mut(request_id) {
            request.last_accessed = Utc::now();
        }
        Ok(())
    }

    async fn recover_unfinished(
        &self,
        message: &str,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Resumable>> {
        let mut guard = self.write()?;
        let Tables {
            summaries,
            requests,
            ..
        } = &mut *guard;

        let mut resumable = Vec::new();
        for (summary_id, row) in summaries.iter_mut() {
            if row.status.is_terminal() {
                continue;
            }
            let handle = requests
                .values()
                .filter(|r| &r.summary_id == summary_id)
                .map(|r| r.id.as_str())
                .min();
            match handle {
                Some(request_id) if row.status == SummaryStatus::Preprocessing => {
                    resumable.push((request_id.to_string(), summary_id.clone()));
                }
                _ => {
                    row.status = SummaryStatus::Failed;
                    row.error = Some(message.to_string());
                    row.ended_at = Some(ended_at);
                }
            }
        }

        Ok(resumable
            .into_iter()
            .filter_map(|(request_id, summary_id)| {
                guard.view(&summary_id).map(|summary| Resumable {
                    request_id,
                    summary,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{request_identity, summary_identity};
    use std::sync::Arc;

    fn new_summary(text: &str) -> NewSummary {
        NewSummary::new(text, "t5", Params::new(), "en")
    }

    #[tokio::test]
    async fn test_insert_creates_all_three_records() {
        let store = InMemoryStore::new();
        let summary = new_summary("Some raw  text.");
        let outcome = store
            .insert_initial_request("req-1", &summary, true, &Warnings::new())
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Created);
        assert!(store.request_exists("req-1").await.unwrap());
        assert!(store.summary_exists(&summary.id).await.unwrap());
        assert!(store
            .source_exists(&source_identity("Some raw  text."))
            .await
            .unwrap());

        let (s, _) = store.get_summary_by_request_id("req-1").await.unwrap().unwrap();
        assert_eq!(s.status, SummaryStatus::Preprocessing);
        assert_eq!(s.request_count, 1);
        assert_eq!(s.source, "Some raw  text.");
        assert!(s.output.is_none());
    }

    #[tokio::test]
    async fn test_insert_same_identity_attaches() {
        let store = InMemoryStore::new();
        let summary = new_summary("text");
        store
            .insert_initial_request("a", &summary, true, &Warnings::new())
            .await
            .unwrap();
        let outcome = store
            .insert_initial_request("b", &summary, false, &Warnings::new())
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Attached);
        assert_eq!(store.summary_count().unwrap(), 1);
        let s = store.get_summary(&summary.id).await.unwrap().unwrap();
        assert_eq!(s.request_count, 2);
        assert_eq!(store.live_requests(&summary.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let store = InMemoryStore::new();
        let summary = new_summary("text");
        store
            .insert_initial_request("a", &summary, true, &Warnings::new())
            .await
            .unwrap();
        let err = store
            .insert_initial_request("a", &summary, true, &Warnings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_request_reads_absent() {
        let store = InMemoryStore::new();
        assert!(store
            .get_summary_by_request_id("nope")
            .await
            .unwrap()
            .is_none());
        // Updates for unknown requests are silently ignored.
        store
            .update_summary("nope", SummaryPatch::status(SummaryStatus::Encoding))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_writes_only_given_fields() {
        let store = InMemoryStore::new();
        let summary = new_summary("text");
        store
            .insert_initial_request("r", &summary, true, &Warnings::new())
            .await
            .unwrap();

        let mut warnings = Warnings::new();
        crate::models::add_warning(&mut warnings, "top_k", "ignored");
        store
            .update_summary(
                "r",
                SummaryPatch::status(SummaryStatus::Encoding).with_warnings(warnings.clone()),
            )
            .await
            .unwrap();

        let (s, w) = store.get_summary_by_request_id("r").await.unwrap().unwrap();
        assert_eq!(s.status, SummaryStatus::Encoding);
        assert_eq!(s.model, "t5");
        assert!(s.output.is_none());
        assert_eq!(w, warnings);
    }

    #[tokio::test]
    async fn test_update_rejects_regression_and_keeps_state() {
        let store = InMemoryStore::new();
        let summary = new_summary("text");
        store
            .insert_initial_request("r", &summary, true, &Warnings::new())
            .await
            .unwrap();
        store
            .update_summary("r", SummaryPatch::status(SummaryStatus::Encoding))
            .await
            .unwrap();
        let err = store
            .update_summary("r", SummaryPatch::status(SummaryStatus::Preprocessing))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let (s, _) = store.get_summary_by_request_id("r").await.unwrap().unwrap();
        assert_eq!(s.status, SummaryStatus::Encoding);
    }

    #[tokio::test]
    async fn test_rekey_moves_summary_requests_and_source() {
        let store = InMemoryStore::new();
        let raw = "Raw   text.";
        let clean = "Raw text.";
        let summary = new_summary(raw);
        store
            .insert_initial_request("r1", &summary, true, &Warnings::new())
            .await
            .unwrap();
        store
            .insert_initial_request("r2", &summary, false, &Warnings::new())
            .await
            .unwrap();

        let new_id = summary_identity(clean, "t5", &Params::new());
        let outcome = store
            .update_source(raw, clean, &summary.id, &new_id)
            .await
            .unwrap();
        assert_eq!(outcome, RekeyOutcome::Rekeyed);

        assert!(!store.summary_exists(&summary.id).await.unwrap());
        assert!(store.summary_exists(&new_id).await.unwrap());
        assert!(!store.source_exists(&source_identity(raw)).await.unwrap());
        assert!(store.source_exists(&source_identity(clean)).await.unwrap());
        for r in ["r1", "r2"] {
            assert_eq!(store.request(r).unwrap().unwrap().summary_id, new_id);
        }
        let s = store.get_summary(&new_id).await.unwrap().unwrap();
        assert_eq!(s.source, clean);
        assert_eq!(s.request_count, 2);
    }

    #[tokio::test]
    async fn test_rekey_keeps_source_shared_with_other_summary() {
        let store = InMemoryStore::new();
        let raw = "Shared   text.";
        let a = new_summary(raw);
        let mut b_params = Params::new();
        b_params.insert("top_k".into(), serde_json::json!(5));
        let b = NewSummary::new(raw, "t5", b_params, "en");
        store
            .insert_initial_request("a", &a, true, &Warnings::new())
            .await
            .unwrap();
        store
            .insert_initial_request("b", &b, true, &Warnings::new())
            .await
            .unwrap();

        let new_id = summary_identity("Shared text.", "t5", &Params::new());
        store
            .update_source(raw, "Shared text.", &a.id, &new_id)
            .await
            .unwrap();
        assert!(store.source_exists(&source_identity(raw)).await.unwrap());
        let other = store.get_summary(&b.id).await.unwrap().unwrap();
        assert_eq!(other.source, raw);
    }

    #[tokio::test]
    async fn test_rekey_onto_existing_summary_merges() {
        let store = InMemoryStore::new();
        let clean = "Same text.";
        let first = new_summary(clean);
        store
            .insert_initial_request("first", &first, true, &Warnings::new())
            .await
            .unwrap();

        let raw = "Same   text.";
        let second = new_summary(raw);
        store
            .insert_initial_request("second", &second, false, &Warnings::new())
            .await
            .unwrap();
        assert_eq!(store.summary_count().unwrap(), 2);

        let outcome = store
            .update_source(raw, clean, &second.id, &first.id)
            .await
            .unwrap();
        assert_eq!(outcome, RekeyOutcome::Merged);
        assert_eq!(store.summary_count().unwrap(), 1);
        assert!(!store.source_exists(&source_identity(raw)).await.unwrap());

        let (a, _) = store
            .get_summary_by_request_id("first")
            .await
            .unwrap()
            .unwrap();
        let (b, _) = store
            .get_summary_by_request_id("second")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.request_count, 2);
        assert_eq!(store.live_requests(&first.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rekey_of_missing_summary_errors() {
        let store = InMemoryStore::new();
        let err = store
            .update_source("a", "b", "missing", "other")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingSummary(_)));
    }

    #[tokio::test]
    async fn test_increment_absent_summary_is_noop() {
        let store = InMemoryStore::new();
        store.increment_summary_count("missing").await.unwrap();
        let summary = new_summary("text");
        store
            .insert_initial_request("r", &summary, true, &Warnings::new())
            .await
            .unwrap();
        store.increment_summary_count(&summary.id).await.unwrap();
        let s = store.get_summary(&summary.id).await.unwrap().unwrap();
        assert_eq!(s.request_count, 2);
    }

    #[tokio::test]
    async fn test_touch_refreshes_last_accessed() {
        let store = InMemoryStore::new();
        let summary = new_summary("text");
        store
            .insert_initial_request("r", &summary, true, &Warnings::new())
            .await
            .unwrap();
        let before = store.request("r").unwrap().unwrap().last_accessed;
        store.touch_request("r").await.unwrap();
        let after = store.request("r").unwrap().unwrap().last_accessed;
        assert!(after >= before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_half_rekeyed_state() {
        let store = Arc::new(InMemoryStore::new());
        let mut pairs = Vec::new();
        for i in 0..50 {
            let raw = format!("text   number {}", i);
            let summary = new_summary(&raw);
            let request_id = request_identity(&raw, "t5", &Params::new());
            store
                .insert_initial_request(&request_id, &summary, true, &Warnings::new())
                .await
                .unwrap();
            pairs.push((request_id, raw, summary.id));
        }

        let reader = {
            let store = store.clone();
            let ids: Vec<String> = pairs.iter().map(|(r, _, _)| r.clone()).collect();
            tokio::spawn(async move {
                for _ in 0..200 {
                    for id in &ids {
                        let found = store.get_summary_by_request_id(id).await.unwrap();
                        assert!(found.is_some(), "request {} lost its summary", id);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for (_, raw, old_id) in &pairs {
            let clean = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            let new_id = summary_identity(&clean, "t5", &Params::new());
            store
                .update_source(raw, &clean, old_id, &new_id)
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_requeues_preprocessing_and_fails_later_stages() {
        let store = InMemoryStore::new();
        let waiting = new_summary("waiting text");
        let running = new_summary("running text");
        let done = new_summary("done text");
        for (request_id, summary) in [("w", &waiting), ("r", &running), ("d", &done)] {
            store
                .insert_initial_request(request_id, summary, true, &Warnings::new())
                .await
                .unwrap();
        }
        store
            .insert_initial_request("w2", &waiting, true, &Warnings::new())
            .await
            .unwrap();
        store
            .update_summary("r", SummaryPatch::status(SummaryStatus::Encoding))
            .await
            .unwrap();
        store
            .update_summary("d", SummaryPatch::failed("boom", Utc::now()))
            .await
            .unwrap();

        let resumable = store.recover_unfinished("interrupted", Utc::now()).await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].request_id, "w");
        assert_eq!(resumable[0].summary.id, waiting.id);
        assert_eq!(resumable[0].summary.source, "waiting text");

        let (r, _) = store.get_summary_by_request_id("r").await.unwrap().unwrap();
        assert_eq!(r.status, SummaryStatus::Failed);
        assert_eq!(r.error.as_deref(), Some("interrupted"));
        assert!(r.ended_at.is_some());
        let (d, _) = store.get_summary_by_request_id("d").await.unwrap().unwrap();
        assert_eq!(d.error.as_deref(), Some("boom"));
        let (w, _) = store.get_summary_by_request_id("w2").await.unwrap().unwrap();
        assert_eq!(w.status, SummaryStatus::Preprocessing);
    }
}
