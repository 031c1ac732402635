//! SQLite implementation of every storage trait.
//!
//! The schema is applied inline via `include_str!` on open. Timestamps are
//! stored as fixed-width RFC 3339 strings so that text comparison orders
//! them correctly.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, trace};

use super::{
    AccessAction, AccessLogEntry, AttemptRecord, AuditSink, NewSession, PackageStatus,
    Question, QuotaStore, Session, SessionStatus, SessionStore, StoreError, SubmissionRecord,
    SubmitOutcome, SubmitRequest, Tryout, TryoutCatalog, UserPackage, Workspace,
};

const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// SQLite-backed store for sessions, quota, catalogue and audit log.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Apply the schema to a pool. Idempotent.
///
/// # Errors
///
/// Returns an error if any statement fails.
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

impl SqliteStore {
    /// Wrap an existing pool. The schema must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        apply_schema(&pool)
            .await
            .context("failed to apply tryout schema")?;

        debug!(path = %path.display(), "tryout database opened");
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- Seeding helpers (content and billing are owned elsewhere) --

    /// Insert or replace tryout metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_tryout(&self, tryout: &Tryout) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO tryouts (id, name, is_free, duration_minutes, required_package) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(tryout.tryout_id)
        .bind(&tryout.name)
        .bind(tryout.is_free)
        .bind(i64::from(tryout.duration_minutes))
        .bind(tryout.required_package)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a question.
    ///
    /// # Errors
    ///
    /// Returns an error if the options cannot be encoded or the write fails.
    pub async fn insert_question(&self, question: &Question) -> Result<(), StoreError> {
        let options = serde_json::to_string(&question.options).map_err(|e| StoreError::Corrupt {
            field: "options",
            detail: e.to_string(),
        })?;
        sqlx::query(
            "INSERT OR REPLACE INTO questions (id, tryout_id, kategori_id, position, prompt, options) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(question.question_id)
        .bind(question.tryout_id)
        .bind(question.kategori_id)
        .bind(question.position)
        .bind(&question.prompt)
        .bind(options)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Grant a package holding to a user. Returns the holding row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn grant_package(
        &self,
        user_id: i64,
        package_id: i64,
        tryout_quota: u32,
        tryout_used: u32,
        expired_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO user_packages (user_id, package_id, tryout_quota, tryout_used, status, expired_at) \
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
        )
        .bind(user_id)
        .bind(package_id)
        .bind(i64::from(tryout_quota))
        .bind(i64::from(tryout_used))
        .bind(ts(expired_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Access-log entries for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn access_log_for_user(&self, user_id: i64) -> Result<Vec<AccessLogEntry>, StoreError> {
        let rows: Vec<(i64, i64, String, bool, Option<String>, String)> = sqlx::query_as(
            "SELECT user_id, tryout_id, action, success, reason, created_at \
             FROM access_log WHERE user_id = ?1 ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, tryout_id, action, success, reason, created_at)| {
                Ok(AccessLogEntry {
                    user_id,
                    tryout_id,
                    action: AccessAction::parse(&action)?,
                    success,
                    reason,
                    timestamp: parse_ts("created_at", &created_at)?,
                })
            })
            .collect()
    }

    /// Attempt ledger rows for a user and tryout, by attempt number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn attempts(
        &self,
        user_id: i64,
        tryout_id: i64,
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows: Vec<(i64, i64, i64, Option<i64>, String)> = sqlx::query_as(
            "SELECT user_id, tryout_id, attempt_number, user_package_id, started_at \
             FROM attempts WHERE user_id = ?1 AND tryout_id = ?2 ORDER BY attempt_number ASC",
        )
        .bind(user_id)
        .bind(tryout_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(user_id, tryout_id, attempt_number, user_package_id, started_at)| {
                    Ok(AttemptRecord {
                        user_id,
                        tryout_id,
                        attempt_number: to_u32("attempt_number", attempt_number)?,
                        user_package_id,
                        started_at: parse_ts("started_at", &started_at)?,
                    })
                },
            )
            .collect()
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((status,)) => SessionStatus::parse(&status),
            None => Err(StoreError::SessionNotFound(session_id.to_owned())),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_or_resume_session(&self, seed: &NewSession) -> Result<Session, StoreError> {
        let started = ts(seed.started_at);
        let inserted = sqlx::query(
            "INSERT INTO sessions (id, tryout_id, user_id, attempt_number, kategori_id, status, \
                                   duration_seconds, time_remaining_seconds, started_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'in_progress', ?6, ?6, ?7, ?7) \
             ON CONFLICT(tryout_id, user_id, attempt_number) DO NOTHING",
        )
        .bind(&seed.session_id)
        .bind(seed.tryout_id)
        .bind(seed.user_id)
        .bind(i64::from(seed.attempt_number))
        .bind(seed.kategori_id)
        .bind(i64::from(seed.duration_seconds))
        .bind(&started)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row: SessionRow = sqlx::query_as(&format!(
            "{SESSION_SELECT} WHERE tryout_id = ?1 AND user_id = ?2 AND attempt_number = ?3"
        ))
        .bind(seed.tryout_id)
        .bind(seed.user_id)
        .bind(i64::from(seed.attempt_number))
        .fetch_one(&self.pool)
        .await?;

        let session = session_row_into_session(row)?;
        trace!(session_id = %session.session_id, created = inserted > 0, "session row ready");
        Ok(session)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SESSION_SELECT} WHERE id = ?1"))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_row_into_session).transpose()
    }

    async fn fetch_workspace(&self, session_id: &str) -> Result<Workspace, StoreError> {
        // Distinguish a missing session from one with no questions.
        self.session_status(session_id).await?;

        let question_rows: Vec<(i64, i64, Option<i64>, i64, String, String)> = sqlx::query_as(
            "SELECT q.id, q.tryout_id, q.kategori_id, q.position, q.prompt, q.options \
             FROM questions q JOIN sessions s ON s.tryout_id = q.tryout_id \
             WHERE s.id = ?1 AND (s.kategori_id IS NULL OR q.kategori_id = s.kategori_id) \
             ORDER BY q.position ASC, q.id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let questions = question_rows
            .into_iter()
            .map(
                |(question_id, tryout_id, kategori_id, position, prompt, options)| {
                    let options: Vec<String> =
                        serde_json::from_str(&options).map_err(|e| StoreError::Corrupt {
                            field: "options",
                            detail: e.to_string(),
                        })?;
                    Ok(Question {
                        question_id,
                        tryout_id,
                        kategori_id,
                        position,
                        prompt,
                        options,
                    })
                },
            )
            .collect::<Result<Vec<_>, StoreError>>()?;

        let answers: Vec<(i64, String)> = sqlx::query_as(
            "SELECT question_id, selected_answer FROM answers WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let bookmarks: Vec<(i64,)> =
            sqlx::query_as("SELECT question_id FROM bookmarks WHERE session_id = ?1")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Workspace {
            questions,
            answers: answers.into_iter().collect(),
            bookmarks: bookmarks.into_iter().map(|(id,)| id).collect(),
        })
    }

    async fn update_time_remaining(
        &self,
        session_id: &str,
        seconds: u32,
    ) -> Result<bool, StoreError> {
        // Never raise the stored value: a late response from an older tick
        // must not overwrite a newer one.
        let result = sqlx::query(
            "UPDATE sessions SET time_remaining_seconds = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'in_progress' AND time_remaining_seconds > ?1",
        )
        .bind(i64::from(seconds))
        .bind(ts(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        trace!(session_id, seconds, applied, "time remaining persisted");
        Ok(applied)
    }

    async fn upsert_answer(
        &self,
        session_id: &str,
        question_id: i64,
        answer: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO answers (session_id, question_id, selected_answer, saved_at) \
             SELECT ?1, ?2, ?3, ?4 \
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND status = 'in_progress') \
             ON CONFLICT(session_id, question_id) DO UPDATE SET \
                selected_answer = excluded.selected_answer, \
                saved_at = excluded.saved_at",
        )
        .bind(session_id)
        .bind(question_id)
        .bind(answer)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.session_status(session_id).await?;
            return Err(StoreError::SessionClosed(session_id.to_owned()));
        }
        trace!(session_id, question_id, "answer saved");
        Ok(())
    }

    async fn replace_bookmarks(
        &self,
        session_id: &str,
        question_ids: &BTreeSet<i64>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        match row {
            None => return Err(StoreError::SessionNotFound(session_id.to_owned())),
            Some((status,)) if SessionStatus::parse(&status)? != SessionStatus::InProgress => {
                return Err(StoreError::SessionClosed(session_id.to_owned()));
            }
            Some(_) => {}
        }

        sqlx::query("DELETE FROM bookmarks WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for question_id in question_ids {
            sqlx::query("INSERT INTO bookmarks (session_id, question_id) VALUES (?1, ?2)")
                .bind(session_id)
                .bind(*question_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        trace!(session_id, count = question_ids.len(), "bookmarks replaced");
        Ok(())
    }

    async fn submit_session(&self, request: &SubmitRequest) -> Result<SubmitOutcome, StoreError> {
        let answers_json =
            serde_json::to_string(&request.answers).map_err(|e| StoreError::Corrupt {
                field: "answers",
                detail: e.to_string(),
            })?;
        let submitted_at = ts(request.submitted_at);

        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = ?1")
            .bind(&request.session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::SessionNotFound(request.session_id.clone()));
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO submissions \
                (session_id, answers, time_spent_seconds, overtime_seconds, submitted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&request.session_id)
        .bind(&answers_json)
        .bind(i64::from(request.time_spent_seconds))
        .bind(i64::from(request.overtime_seconds))
        .bind(&submitted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "UPDATE sessions SET status = 'completed', completed_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status != 'completed'",
        )
        .bind(&request.session_id)
        .bind(&submitted_at)
        .execute(&mut *tx)
        .await?;

        let (session_id, answers, time_spent, overtime, stored_at): (String, String, i64, i64, String) =
            sqlx::query_as(
                "SELECT session_id, answers, time_spent_seconds, overtime_seconds, submitted_at \
                 FROM submissions WHERE session_id = ?1",
            )
            .bind(&request.session_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let answers: BTreeMap<i64, String> =
            serde_json::from_str(&answers).map_err(|e| StoreError::Corrupt {
                field: "answers",
                detail: e.to_string(),
            })?;

        Ok(SubmitOutcome {
            record: SubmissionRecord {
                session_id,
                answers,
                time_spent_seconds: to_u32("time_spent_seconds", time_spent)?,
                overtime_seconds: to_u32("overtime_seconds", overtime)?,
                submitted_at: parse_ts("submitted_at", &stored_at)?,
            },
            newly_submitted: inserted > 0,
        })
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn user_packages(&self, user_id: i64) -> Result<Vec<UserPackage>, StoreError> {
        let rows: Vec<(i64, i64, i64, i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, user_id, package_id, tryout_quota, tryout_used, status, expired_at \
             FROM user_packages WHERE user_id = ?1 ORDER BY expired_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, user_id, package_id, quota, used, status, expired_at)| {
                    Ok(UserPackage {
                        id,
                        user_id,
                        package_id,
                        tryout_quota: to_u32("tryout_quota", quota)?,
                        tryout_used: to_u32("tryout_used", used)?,
                        status: PackageStatus::parse(&status)?,
                        expired_at: parse_ts("expired_at", &expired_at)?,
                    })
                },
            )
            .collect()
    }

    async fn consume_quota(
        &self,
        user_id: i64,
        package_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let consumed = consume_one(&mut conn, user_id, package_id, now).await?;
        debug!(user_id, ?package_id, ?consumed, "quota consume attempted");
        Ok(consumed)
    }

    async fn count_attempts(&self, user_id: i64, tryout_id: i64) -> Result<u32, StoreError> {
        let row: (i64,) =
            sqlx::query_as("SELECT count(*) FROM attempts WHERE user_id = ?1 AND tryout_id = ?2")
                .bind(user_id)
                .bind(tryout_id)
                .fetch_one(&self.pool)
                .await?;
        to_u32("attempt count", row.0)
    }

    async fn record_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        user_package_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut conn = self.pool.acquire().await?;
        append_attempt(&mut conn, user_id, tryout_id, user_package_id, started_at).await
    }

    async fn charge_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        package_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        // The update takes the write lock first, so the insert cannot be
        // starved by another start between the two statements.
        let mut tx = self.pool.begin().await?;

        let Some(holding) = consume_one(&mut tx, user_id, package_id, started_at).await? else {
            debug!(user_id, tryout_id, ?package_id, "no quota left to charge");
            return Ok(None);
        };
        let attempt_number =
            append_attempt(&mut tx, user_id, tryout_id, Some(holding), started_at).await?;

        tx.commit().await?;
        debug!(user_id, tryout_id, holding, attempt_number, "attempt charged");
        Ok(Some(AttemptRecord {
            user_id,
            tryout_id,
            attempt_number,
            user_package_id: Some(holding),
            started_at,
        }))
    }

    async fn void_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        attempt_number: u32,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>,)> = sqlx::query_as(
            "DELETE FROM attempts WHERE user_id = ?1 AND tryout_id = ?2 AND attempt_number = ?3 \
             RETURNING user_package_id",
        )
        .bind(user_id)
        .bind(tryout_id)
        .bind(i64::from(attempt_number))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((holding,)) = row else {
            return Ok(false);
        };
        if let Some(holding) = holding {
            sqlx::query(
                "UPDATE user_packages SET tryout_used = tryout_used - 1 \
                 WHERE id = ?1 AND tryout_used > 0",
            )
            .bind(holding)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(user_id, tryout_id, attempt_number, ?holding, "attempt voided");
        Ok(true)
    }
}

/// Guarded increment on the earliest-expiring eligible holding.
async fn consume_one(
    conn: &mut SqliteConnection,
    user_id: i64,
    package_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<i64>, StoreError> {
    // One statement: the selection and the guarded increment cannot be
    // interleaved with another start.
    let row: Option<(i64,)> = sqlx::query_as(
        "UPDATE user_packages SET tryout_used = tryout_used + 1 \
         WHERE id = ( \
            SELECT id FROM user_packages \
            WHERE user_id = ?1 AND status = 'active' AND expired_at > ?2 \
              AND tryout_used < tryout_quota \
              AND (?3 IS NULL OR package_id = ?3) \
            ORDER BY expired_at ASC, id ASC \
            LIMIT 1) \
         AND tryout_used < tryout_quota \
         RETURNING id",
    )
    .bind(user_id)
    .bind(ts(now))
    .bind(package_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(id,)| id))
}

/// Ledger insert; the number is assigned inside the insert so concurrent
/// starts cannot receive the same attempt number.
async fn append_attempt(
    conn: &mut SqliteConnection,
    user_id: i64,
    tryout_id: i64,
    user_package_id: Option<i64>,
    started_at: DateTime<Utc>,
) -> Result<u32, StoreError> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO attempts (user_id, tryout_id, attempt_number, user_package_id, started_at) \
         SELECT ?1, ?2, COALESCE(MAX(attempt_number), 0) + 1, ?3, ?4 \
         FROM attempts WHERE user_id = ?1 AND tryout_id = ?2 \
         RETURNING attempt_number",
    )
    .bind(user_id)
    .bind(tryout_id)
    .bind(user_package_id)
    .bind(ts(started_at))
    .fetch_one(&mut *conn)
    .await?;
    to_u32("attempt_number", row.0)
}

#[async_trait]
impl TryoutCatalog for SqliteStore {
    async fn tryout(&self, tryout_id: i64) -> Result<Option<Tryout>, StoreError> {
        let row: Option<(i64, String, bool, i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, name, is_free, duration_minutes, required_package FROM tryouts WHERE id = ?1",
        )
        .bind(tryout_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(tryout_id, name, is_free, duration, required_package)| {
            Ok(Tryout {
                tryout_id,
                name,
                is_free,
                duration_minutes: to_u32("duration_minutes", duration)?,
                required_package,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, entry: &AccessLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO access_log (user_id, tryout_id, action, success, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(entry.user_id)
        .bind(entry.tryout_id)
        .bind(entry.action.as_str())
        .bind(entry.success)
        .bind(&entry.reason)
        .bind(ts(entry.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const SESSION_SELECT: &str = "SELECT id, tryout_id, user_id, attempt_number, kategori_id, status, \
     duration_seconds, time_remaining_seconds, started_at, updated_at, completed_at FROM sessions";

/// Raw row tuple from the `sessions` table.
type SessionRow = (
    String,
    i64,
    i64,
    i64,
    Option<i64>,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
);

/// Convert a raw `sessions` row tuple into a [`Session`].
fn session_row_into_session(row: SessionRow) -> Result<Session, StoreError> {
    let (
        session_id,
        tryout_id,
        user_id,
        attempt_number,
        kategori_id,
        status,
        duration,
        remaining,
        started_at,
        updated_at,
        completed_at,
    ) = row;
    Ok(Session {
        session_id,
        tryout_id,
        user_id,
        attempt_number: to_u32("attempt_number", attempt_number)?,
        kategori_id,
        status: SessionStatus::parse(&status)?,
        duration_seconds: to_u32("duration_seconds", duration)?,
        time_remaining_seconds: to_u32("time_remaining_seconds", remaining)?,
        started_at: parse_ts("started_at", &started_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_ts("completed_at", s))
            .transpose()?,
    })
}

/// Fixed-width UTC timestamp for storage.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(field: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            field,
            detail: e.to_string(),
        })
}

fn to_u32(field: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        field,
        detail: format!("{value} out of range"),
    })
}
