//! SQLite-backed [`Store`] implementation.
//!
//! Each mutating operation runs inside one transaction, so readers on other
//! connections see either the state before or after it, never a half-applied
//! re-key. A transaction that hits `SQLITE_BUSY` or `SQLITE_LOCKED` is rolled
//! back and retried with linear backoff; once the attempts run out the
//! caller gets [`StoreError::Contention`]. Writers inside this process are
//! serialized on a mutex first, so the retry loop only ever deals with other
//! processes sharing the database file.
//!
//! Timestamps are stored as RFC 3339 text with nanosecond precision, and
//! params and warnings as JSON text.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use synopsis_core::identity::source_identity;
use synopsis_core::models::{NewSummary, Params, Summary, SummaryPatch, SummaryStatus, Warnings};
use synopsis_core::store::{
    validate_patch, InsertOutcome, RekeyOutcome, Resumable, Store, StoreError, StoreResult,
};

use crate::config::Config;
use crate::{db, migrate};

const SUMMARY_COLUMNS: &str = "s.id, s.source_id, src.content, s.output, s.output_length, \
     s.model, s.params_json, s.status, s.error, s.started_at, s.ended_at, s.language, \
     s.request_count";

/// Failure inside one attempt: either SQLite itself or a store rule.
enum TxError {
    Sql(sqlx::Error),
    Store(StoreError),
}

impl From<sqlx::Error> for TxError {
    fn from(e: sqlx::Error) -> Self {
        TxError::Sql(e)
    }
}

impl From<StoreError> for TxError {
    fn from(e: StoreError) -> Self {
        TxError::Store(e)
    }
}

impl From<serde_json::Error> for TxError {
    fn from(e: serde_json::Error) -> Self {
        TxError::Store(StoreError::Backend(format!("invalid JSON column: {}", e)))
    }
}

type TxResult<T> = Result<T, TxError>;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            max_retries: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }

    pub fn with_retry(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool).with_retry(
            config.store.max_retries,
            Duration::from_millis(config.store.retry_backoff_ms),
        ))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of requests currently pointing at `summary_id`.
    pub async fn live_requests(&self, summary_id: &str) -> StoreResult<usize> {
        self.retry("live_requests", || async move {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE summary_id = ?")
                .bind(summary_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(n as usize)
        })
        .await
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TxResult<T>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(TxError::Store(e)) => return Err(e),
                Err(TxError::Sql(e)) if is_contention(&e) => {
                    if tries >= self.max_retries {
                        warn!(operation, attempts = tries, "giving up on locked database");
                        return Err(StoreError::Contention {
                            operation,
                            attempts: tries,
                        });
                    }
                    debug!(operation, attempt = tries, error = %e, "database locked, retrying");
                    tokio::time::sleep(self.retry_backoff * tries).await;
                }
                Err(TxError::Sql(e)) => return Err(StoreError::Backend(e.to_string())),
            }
        }
    }

    async fn try_insert(
        &self,
        request_id: &str,
        summary: &NewSummary,
        cache: bool,
        warnings: &Warnings,
    ) -> TxResult<InsertOutcome> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if exists(&mut tx, "SELECT COUNT(*) > 0 FROM requests WHERE id = ?", request_id).await? {
            return Err(StoreError::DuplicateRequest(request_id.to_string()).into());
        }

        let outcome =
            if exists(&mut tx, "SELECT COUNT(*) > 0 FROM summaries WHERE id = ?", &summary.id)
                .await?
            {
                sqlx::query("UPDATE summaries SET request_count = request_count + 1 WHERE id = ?")
                    .bind(&summary.id)
                    .execute(&mut *tx)
                    .await?;
                InsertOutcome::Attached
            } else {
                let source_id = ensure_source(&mut tx, &summary.source).await?;
                sqlx::query(
                    r#"
                    INSERT INTO summaries (id, source_id, model, params_json, status,
                                           started_at, language, request_count)
                    VALUES (?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(&summary.id)
                .bind(&source_id)
                .bind(&summary.model)
                .bind(serde_json::to_string(&summary.params)?)
                .bind(SummaryStatus::Preprocessing.as_str())
                .bind(format_ts(&summary.started_at))
                .bind(&summary.language)
                .execute(&mut *tx)
                .await?;
                InsertOutcome::Created
            };

        sqlx::query(
            "INSERT INTO requests (id, summary_id, cache, last_accessed, warnings_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(&summary.id)
        .bind(cache)
        .bind(format_ts(&Utc::now()))
        .bind(serde_json::to_string(warnings)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn try_update(&self, request_id: &str, patch: &SummaryPatch) -> TxResult<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let summary_id: Option<String> =
            sqlx::query_scalar("SELECT summary_id FROM requests WHERE id = ?")
                .bind(request_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(summary_id) = summary_id else {
            return Ok(());
        };

        if patch.touches_summary() {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM summaries WHERE id = ?")
                    .bind(&summary_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(status) = status else {
                warn!(
                    request_id,
                    summary_id = %summary_id,
                    "update for a request whose summary is missing"
                );
                return Ok(());
            };
            validate_patch(&summary_id, parse_status(&status)?, patch)?;

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE summaries SET ");
            let mut set = qb.separated(", ");
            if let Some(output) = &patch.output {
                set.push("output = ").push_bind_unseparated(output.clone());
            }
            if let Some(len) = patch.output_length {
                set.push("output_length = ").push_bind_unseparated(len as i64);
            }
            if let Some(params) = &patch.params {
                set.push("params_json = ")
                    .push_bind_unseparated(serde_json::to_string(params)?);
            }
            if let Some(status) = patch.status {
                set.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(error) = &patch.error {
                set.push("error = ").push_bind_unseparated(error.clone());
            }
            if let Some(started_at) = &patch.started_at {
                set.push("started_at = ").push_bind_unseparated(format_ts(started_at));
            }
            if let Some(ended_at) = &patch.ended_at {
                set.push("ended_at = ").push_bind_unseparated(format_ts(ended_at));
            }
            qb.push(" WHERE id = ").push_bind(summary_id.clone());
            qb.build().execute(&mut *tx).await?;
        }

        if let Some(warnings) = &patch.warnings {
            sqlx::query("UPDATE requests SET warnings_json = ? WHERE id = ?")
                .bind(serde_json::to_string(warnings)?)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_rekey(
        &self,
        old_source: &str,
        new_source: &str,
        old_summary_id: &str,
        new_summary_id: &str,
    ) -> TxResult<RekeyOutcome> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let summary_exists = "SELECT COUNT(*) > 0 FROM summaries WHERE id = ?";

        if !exists(&mut tx, summary_exists, old_summary_id).await? {
            return Err(StoreError::MissingSummary(old_summary_id.to_string()).into());
        }
        if old_summary_id == new_summary_id {
            return Ok(RekeyOutcome::Rekeyed);
        }

        let old_source_id = source_identity(old_source);

        let outcome = if exists(&mut tx, summary_exists, new_summary_id).await? {
            let moved = sqlx::query("UPDATE requests SET summary_id = ? WHERE summary_id = ?")
                .bind(new_summary_id)
                .bind(old_summary_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("UPDATE summaries SET request_count = request_count + ? WHERE id = ?")
                .bind(moved as i64)
                .bind(new_summary_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM summaries WHERE id = ?")
                .bind(old_summary_id)
                .execute(&mut *tx)
                .await?;
            release_source(&mut tx, &old_source_id).await?;
            RekeyOutcome::Merged
        } else {
            let new_source_id = ensure_source(&mut tx, new_source).await?;
            sqlx::query("UPDATE summaries SET id = ?, source_id = ? WHERE id = ?")
                .bind(new_summary_id)
                .bind(&new_source_id)
                .bind(old_summary_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE requests SET summary_id = ? WHERE summary_id = ?")
                .bind(new_summary_id)
                .bind(old_summary_id)
                .execute(&mut *tx)
                .await?;
            if new_source_id != old_source_id {
                release_source(&mut tx, &old_source_id).await?;
            }
            RekeyOutcome::Rekeyed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn try_recover(
        &self,
        message: &str,
        ended_at: &DateTime<Utc>,
    ) -> TxResult<Vec<Resumable>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            "UPDATE summaries SET status = 'failed', error = ?, ended_at = ? \
             WHERE status IN ('encoding', 'summarizing', 'postprocessing') \
                OR (status = 'preprocessing' \
                    AND NOT EXISTS (SELECT 1 FROM requests r WHERE r.summary_id = summaries.id))",
        )
        .bind(message)
        .bind(format_ts(ended_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let sql = format!(
            "SELECT MIN(r.id) AS handle, {} \
             FROM summaries s \
             JOIN requests r ON r.summary_id = s.id \
             LEFT JOIN sources src ON src.id = s.source_id \
             WHERE s.status = 'preprocessing' \
             GROUP BY s.id",
            SUMMARY_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
        let mut resumable = Vec::with_capacity(rows.len());
        for row in &rows {
            resumable.push(Resumable {
                request_id: row.try_get("handle")?,
                summary: summary_from_row(row)?,
            });
        }

        tx.commit().await?;
        debug!(failed, resumable = resumable.len(), "settled unfinished summaries");
        Ok(resumable)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn request_exists(&self, request_id: &str) -> StoreResult<bool> {
        self.retry("request_exists", || async move {
            let found: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM requests WHERE id = ?")
                .bind(request_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(found)
        })
        .await
    }

    async fn summary_exists(&self, summary_id: &str) -> StoreResult<bool> {
        self.retry("summary_exists", || async move {
            let found: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM summaries WHERE id = ?")
                    .bind(summary_id)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(found)
        })
        .await
    }

    async fn source_exists(&self, source_id: &str) -> StoreResult<bool> {
        self.retry("source_exists", || async move {
            let found: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sources WHERE id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(found)
        })
        .await
    }

    async fn get_summary_by_request_id(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<(Summary, Warnings)>> {
        self.retry("get_summary_by_request_id", || async move {
            // One statement, so the request and its summary come from the
            // same snapshot even while a re-key commits.
            let sql = format!(
                "SELECT r.summary_id AS request_summary_id, r.warnings_json, {} \
                 FROM requests r \
                 LEFT JOIN summaries s ON s.id = r.summary_id \
                 LEFT JOIN sources src ON src.id = s.source_id \
                 WHERE r.id = ?",
                SUMMARY_COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Ok(None);
            };

            let summary_id: Option<String> = row.try_get("id")?;
            if summary_id.is_none() {
                let dangling: String = row.try_get("request_summary_id")?;
                warn!(
                    request_id,
                    summary_id = %dangling,
                    "request points at a missing summary"
                );
                return Ok(None);
            }

            let warnings_json: String = row.try_get("warnings_json")?;
            let warnings: Warnings = serde_json::from_str(&warnings_json)?;
            Ok(Some((summary_from_row(&row)?, warnings)))
        })
        .await
    }

    async fn get_summary(&self, summary_id: &str) -> StoreResult<Option<Summary>> {
        self.retry("get_summary", || async move {
            let sql = format!(
                "SELECT {} FROM summaries s \
                 LEFT JOIN sources src ON src.id = s.source_id \
                 WHERE s.id = ?",
                SUMMARY_COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(summary_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(summary_from_row).transpose()
        })
        .await
    }

    async fn insert_initial_request(
        &self,
        request_id: &str,
        summary: &NewSummary,
        cache: bool,
        warnings: &Warnings,
    ) -> StoreResult<InsertOutcome> {
        self.retry("insert_initial_request", || {
            self.try_insert(request_id, summary, cache, warnings)
        })
        .await
    }

    async fn update_summary(&self, request_id: &str, patch: SummaryPatch) -> StoreResult<()> {
        self.retry("update_summary", || self.try_update(request_id, &patch))
            .await
    }

    async fn update_source(
        &self,
        old_source: &str,
        new_source: &str,
        old_summary_id: &str,
        new_summary_id: &str,
    ) -> StoreResult<RekeyOutcome> {
        self.retry("update_source", || {
            self.try_rekey(old_source, new_source, old_summary_id, new_summary_id)
        })
        .await
    }

    async fn increment_summary_count(&self, summary_id: &str) -> StoreResult<()> {
        self.retry("increment_summary_count", || async move {
            let _write = self.write_lock.lock().await;
            sqlx::query("UPDATE summaries SET request_count = request_count + 1 WHERE id = ?")
                .bind(summary_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn touch_request(&self, request_id: &str) -> StoreResult<()> {
        self.retry("touch_request", || async move {
            let _write = self.write_lock.lock().await;
            sqlx::query("UPDATE requests SET last_accessed = ? WHERE id = ?")
                .bind(format_ts(&Utc::now()))
                .bind(request_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn recover_unfinished(
        &self,
        message: &str,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Resumable>> {
        self.retry("recover_unfinished", || self.try_recover(message, &ended_at))
            .await
    }
}

fn is_contention(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            // Extended result codes keep the primary code in the low byte.
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6)) || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

async fn exists(tx: &mut Transaction<'_, Sqlite>, sql: &str, id: &str) -> TxResult<bool> {
    let found: bool = sqlx::query_scalar(sql)
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(found)
}

/// Insert the source for `text` unless it is already stored; returns its id.
async fn ensure_source(tx: &mut Transaction<'_, Sqlite>, text: &str) -> TxResult<String> {
    let id = source_identity(text);
    sqlx::query("INSERT OR IGNORE INTO sources (id, content, content_length) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(text)
        .bind(text.chars().count() as i64)
        .execute(&mut **tx)
        .await?;
    Ok(id)
}

/// Delete a source no summary references any more.
async fn release_source(tx: &mut Transaction<'_, Sqlite>, source_id: &str) -> TxResult<()> {
    sqlx::query(
        "DELETE FROM sources WHERE id = ? \
         AND NOT EXISTS (SELECT 1 FROM summaries WHERE source_id = ?)",
    )
    .bind(source_id)
    .bind(source_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn summary_from_row(row: &SqliteRow) -> TxResult<Summary> {
    let params_json: String = row.try_get("params_json")?;
    let params: Params = serde_json::from_str(&params_json)?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;
    let output_length: Option<i64> = row.try_get("output_length")?;
    let request_count: i64 = row.try_get("request_count")?;
    let source: Option<String> = row.try_get("content")?;

    Ok(Summary {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        source: source.unwrap_or_default(),
        output: row.try_get("output")?,
        output_length: output_length.map(|n| n as usize),
        model: row.try_get("model")?,
        params,
        status: parse_status(&status)?,
        error: row.try_get("error")?,
        started_at: parse_ts(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        language: row.try_get("language")?,
        request_count: request_count as u32,
    })
}

fn parse_status(s: &str) -> TxResult<SummaryStatus> {
    s.parse::<SummaryStatus>()
        .map_err(|e| TxError::Store(StoreError::Backend(e)))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> TxResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            TxError::Store(StoreError::Backend(format!(
                "invalid timestamp '{}': {}",
                s, e
            )))
        })
}
