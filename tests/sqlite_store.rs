//! Integration tests for the SQLite job store.
//!
//! These run against a real database file in a temporary directory, so they
//! cover the schema, the JSON and timestamp encodings, and transaction
//! behaviour under concurrent writers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use synopsis::config::{Config, StoreBackend};
use synopsis::coordinator::{Coordinator, Submission, INTERRUPTED};
use synopsis::identity::{request_identity, source_identity, summary_identity};
use synopsis::migrate;
use synopsis::models::{
    add_warning, NewSummary, Params, Summary, SummaryPatch, SummaryStatus, Warnings,
};
use synopsis::pipeline::Capabilities;
use synopsis::sqlite_store::SqliteStore;
use synopsis::store::{InsertOutcome, RekeyOutcome, Store, StoreError};
use synopsis::text::StopwordDetector;

fn test_config(tmp: &TempDir) -> Config {
    let mut cfg = Config::minimal();
    cfg.db.path = tmp.path().join("data").join("synopsis.sqlite");
    cfg.store.backend = StoreBackend::Sqlite;
    cfg
}

async fn open(tmp: &TempDir) -> SqliteStore {
    SqliteStore::open(&test_config(tmp)).await.unwrap()
}

fn new_summary(text: &str) -> NewSummary {
    NewSummary::new(text, "t5", Params::new(), "en")
}

const MUSEUM: &str = "The museum reopened after a long renovation of its main hall. \
    Visitors can now see the restored ceiling and the new lighting. \
    The museum also added a cafe and a larger shop near the entrance. \
    Tickets for the first week were sold out within a day of the announcement.";

async fn wait_terminal(coordinator: &Coordinator, request_id: &str) -> Summary {
    for _ in 0..200 {
        let (s, _) = coordinator.fetch(request_id).await.unwrap().unwrap();
        if s.status.is_terminal() {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("summary for {} never finished", request_id);
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    assert!(cfg.db.path.exists());
}

#[tokio::test]
async fn test_insert_read_back_and_attach() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let summary = new_summary("Some   text.");
    let mut warnings = Warnings::new();
    add_warning(&mut warnings, "top_k", "expected an integer; ignored");

    let outcome = store
        .insert_initial_request("r1", &summary, true, &warnings)
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Created);

    let (s, w) = store.get_summary_by_request_id("r1").await.unwrap().unwrap();
    assert_eq!(s.id, summary.id);
    assert_eq!(s.status, SummaryStatus::Preprocessing);
    assert_eq!(s.source, "Some   text.");
    assert_eq!(s.request_count, 1);
    assert_eq!(s.started_at, summary.started_at);
    assert_eq!(w, warnings);

    let outcome = store
        .insert_initial_request("r2", &summary, false, &Warnings::new())
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Attached);
    let s = store.get_summary(&summary.id).await.unwrap().unwrap();
    assert_eq!(s.request_count, 2);

    let err = store
        .insert_initial_request("r1", &summary, true, &Warnings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateRequest(_)));
}

#[tokio::test]
async fn test_partial_update_and_transition_rules() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
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
        .update_summary("r", SummaryPatch::status(SummaryStatus::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    store
        .update_summary("r", SummaryPatch::failed("boom", chrono::Utc::now()))
        .await
        .unwrap();
    let (s, _) = store.get_summary_by_request_id("r").await.unwrap().unwrap();
    assert_eq!(s.status, SummaryStatus::Failed);
    assert_eq!(s.error.as_deref(), Some("boom"));
    assert_eq!(s.model, "t5");
    assert!(s.output.is_none());

    let err = store
        .update_summary("r", SummaryPatch::status(SummaryStatus::Summarizing))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Finalized { .. }));

    // Unknown requests are ignored.
    store
        .update_summary("missing", SummaryPatch::status(SummaryStatus::Encoding))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rekey_and_merge() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let params = Params::new();

    let raw = "Rust   is fast.";
    let clean = "Rust is fast.";
    let first = new_summary(raw);
    store
        .insert_initial_request("a", &first, true, &Warnings::new())
        .await
        .unwrap();
    let clean_id = summary_identity(clean, "t5", &params);
    let outcome = store
        .update_source(raw, clean, &first.id, &clean_id)
        .await
        .unwrap();
    assert_eq!(outcome, RekeyOutcome::Rekeyed);
    assert!(!store.summary_exists(&first.id).await.unwrap());
    assert!(!store.source_exists(&source_identity(raw)).await.unwrap());
    assert!(store.source_exists(&source_identity(clean)).await.unwrap());
    let (s, _) = store.get_summary_by_request_id("a").await.unwrap().unwrap();
    assert_eq!(s.id, clean_id);
    assert_eq!(s.source, clean);

    let other_raw = "Rust is   fast.";
    let second = new_summary(other_raw);
    store
        .insert_initial_request("b", &second, true, &Warnings::new())
        .await
        .unwrap();
    let outcome = store
        .update_source(other_raw, clean, &second.id, &clean_id)
        .await
        .unwrap();
    assert_eq!(outcome, RekeyOutcome::Merged);
    assert!(!store.summary_exists(&second.id).await.unwrap());

    let (s, _) = store.get_summary_by_request_id("b").await.unwrap().unwrap();
    assert_eq!(s.id, clean_id);
    assert_eq!(s.request_count, 2);
    assert_eq!(store.live_requests(&clean_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let summary = new_summary("persistent text");
    {
        let store = open(&tmp).await;
        store
            .insert_initial_request("r", &summary, true, &Warnings::new())
            .await
            .unwrap();
        store.pool().close().await;
    }
    let store = open(&tmp).await;
    let (s, _) = store.get_summary_by_request_id("r").await.unwrap().unwrap();
    assert_eq!(s.id, summary.id);
    assert_eq!(s.started_at, summary.started_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_converge_on_one_summary() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open(&tmp).await);
    let summary = new_summary("shared text");

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        let summary = summary.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert_initial_request(&format!("r{}", i), &summary, true, &Warnings::new())
                .await
                .unwrap()
        }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.unwrap() == InsertOutcome::Created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    let s = store.get_summary(&summary.id).await.unwrap().unwrap();
    assert_eq!(s.request_count, 16);
    assert_eq!(store.live_requests(&summary.id).await.unwrap(), 16);
}

#[tokio::test]
async fn test_full_pipeline_on_sqlite() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await.unwrap());
    let (coordinator, _dispatcher) = Coordinator::start(
        &cfg,
        store.clone(),
        Capabilities::builtin(cfg.pipeline.max_chunk_tokens),
        Arc::new(StopwordDetector::new()),
    );

    let text = MUSEUM;
    let mut sub = Submission::new(format!("  {}  ", text));
    sub.params.insert("top_k".to_string(), json!(50));
    let (accepted, _) = coordinator.submit(sub).await.unwrap();

    let done = wait_terminal(&coordinator, &accepted.id).await;
    assert_eq!(done.status, SummaryStatus::Completed);
    assert_eq!(done.params["top_k"], json!(50));
    assert!(done.output.is_some());

    let mut effective = synopsis::params::validate_params(&Params::new()).params;
    effective.insert("top_k".to_string(), json!(50));
    let rekeyed = summary_identity(text, "t5", &effective);
    assert!(store.summary_exists(&rekeyed).await.unwrap());
}

#[tokio::test]
async fn test_work_left_unfinished_by_a_stopped_process_is_recovered() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let params = synopsis::params::validate_params(&Params::new()).params;
    let raw = format!("{}\n\n   ", MUSEUM.replace(". ", ".   "));
    let stranded_request = "ab".repeat(32);
    let interrupted_request = "cd".repeat(32);
    {
        // A process that accepted two submissions and stopped: one never
        // left preprocessing, the other stopped mid-encoding.
        let store = SqliteStore::open(&cfg).await.unwrap();
        let stranded = NewSummary::new(&raw, "t5", params.clone(), "en");
        store
            .insert_initial_request(&stranded_request, &stranded, true, &Warnings::new())
            .await
            .unwrap();
        let encoding = NewSummary::new("A different article about trains.", "t5", params.clone(), "en");
        store
            .insert_initial_request(&interrupted_request, &encoding, true, &Warnings::new())
            .await
            .unwrap();
        store
            .update_summary(&interrupted_request, SummaryPatch::status(SummaryStatus::Encoding))
            .await
            .unwrap();
        store.pool().close().await;
    }

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await.unwrap());
    let (coordinator, _dispatcher) = Coordinator::start(
        &cfg,
        store.clone(),
        Capabilities::builtin(cfg.pipeline.max_chunk_tokens),
        Arc::new(StopwordDetector::new()),
    );
    let (accepted, _) = coordinator.submit(Submission::new(raw.clone())).await.unwrap();
    assert_ne!(accepted.id, stranded_request);

    let done = wait_terminal(&coordinator, &accepted.id).await;
    assert_eq!(done.status, SummaryStatus::Completed, "error: {:?}", done.error);
    let stranded = wait_terminal(&coordinator, &stranded_request).await;
    assert_eq!(stranded.status, SummaryStatus::Completed);
    assert_eq!(stranded.output, done.output);

    let (interrupted, _) = coordinator.fetch(&interrupted_request).await.unwrap().unwrap();
    assert_eq!(interrupted.status, SummaryStatus::Failed);
    assert_eq!(interrupted.error.as_deref(), Some(INTERRUPTED));
    assert!(interrupted.ended_at.is_some());
}

#[tokio::test]
async fn test_recovery_runs_once_per_coordinator() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await.unwrap());
    let (coordinator, _dispatcher) = Coordinator::start(
        &cfg,
        store.clone(),
        Capabilities::builtin(cfg.pipeline.max_chunk_tokens),
        Arc::new(StopwordDetector::new()),
    );
    coordinator.recover().await.unwrap();

    // Work accepted after recovery belongs to this process and is left alone.
    let live = new_summary("live text");
    store
        .insert_initial_request("live", &live, true, &Warnings::new())
        .await
        .unwrap();
    store
        .update_summary("live", SummaryPatch::status(SummaryStatus::Encoding))
        .await
        .unwrap();
    coordinator.recover().await.unwrap();

    let (s, _) = store.get_summary_by_request_id("live").await.unwrap().unwrap();
    assert_eq!(s.status, SummaryStatus::Encoding);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_half_rekeyed_state() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open(&tmp).await);
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
            for _ in 0..20 {
                for id in &ids {
                    let found = store.get_summary_by_request_id(id).await.unwrap();
                    assert!(found.is_some(), "request {} lost its summary", id);
                }
            }
        })
    };

    for (_, raw, old_id) in &pairs {
        let clean = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let new_id = summary_identity(&clean, "t5", &Params::new());
        let outcome = store
            .update_source(raw, &clean, old_id, &new_id)
            .await
            .unwrap();
        assert_eq!(outcome, RekeyOutcome::Rekeyed);
    }

    reader.await.unwrap();
    for (request_id, raw, old_id) in &pairs {
        let (s, _) = store.get_summary_by_request_id(request_id).await.unwrap().unwrap();
        assert_ne!(&s.id, old_id);
        assert_eq!(s.source, raw.split_whitespace().collect::<Vec<_>>().join(" "));
    }
}
