//! Durable state for tryout attempts and the collaborator traits over it.
//!
//! Four seams mirror the external collaborators an attempt depends on:
//! [`SessionStore`] (sessions, answers, bookmarks, submissions),
//! [`QuotaStore`] (packages and the attempt ledger), [`TryoutCatalog`]
//! (tryout metadata) and [`AuditSink`] (access log). [`sqlite::SqliteStore`]
//! implements all of them over one SQLite pool.

pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Lifecycle of an attempt session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but the countdown has not begun.
    NotStarted,
    /// Countdown running; answers may change.
    InProgress,
    /// Submitted. Terminal.
    Completed,
}

impl SessionStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(StoreError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// One attempt's durable session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identifier (UUID v4).
    pub session_id: String,
    /// Tryout being attempted.
    pub tryout_id: i64,
    /// Owner of the attempt.
    pub user_id: i64,
    /// Attempt number stamped into the access token.
    pub attempt_number: u32,
    /// Subtest scope, when the session covers a single kategori.
    pub kategori_id: Option<i64>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Full exam length in seconds.
    pub duration_seconds: u32,
    /// Last persisted countdown value.
    pub time_remaining_seconds: u32,
    /// Server time the session was created.
    pub started_at: DateTime<Utc>,
    /// Server time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Server time of submission.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Seed for a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Identifier to use if the row is created.
    pub session_id: String,
    /// Tryout being attempted.
    pub tryout_id: i64,
    /// Owner of the attempt.
    pub user_id: i64,
    /// Attempt number from the verified token.
    pub attempt_number: u32,
    /// Optional subtest scope.
    pub kategori_id: Option<i64>,
    /// Initial `time_remaining`, in seconds.
    pub duration_seconds: u32,
    /// Creation time.
    pub started_at: DateTime<Utc>,
}

/// A multiple-choice question as loaded for an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Stable question identifier.
    pub question_id: i64,
    /// Owning tryout.
    pub tryout_id: i64,
    /// Subtest the question belongs to.
    pub kategori_id: Option<i64>,
    /// Display order within the tryout.
    pub position: i64,
    /// Question text.
    pub prompt: String,
    /// Option labels.
    pub options: Vec<String>,
}

/// Everything the runtime needs to resume an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspace {
    /// Questions in display order.
    pub questions: Vec<Question>,
    /// Saved answers keyed by question id.
    pub answers: BTreeMap<i64, String>,
    /// Bookmarked question ids.
    pub bookmarks: BTreeSet<i64>,
}

/// Tryout metadata relevant to access control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tryout {
    /// Tryout identifier.
    pub tryout_id: i64,
    /// Display name.
    pub name: String,
    /// Free tryouts bypass quota entirely.
    pub is_free: bool,
    /// Exam length in minutes.
    pub duration_minutes: u32,
    /// Package id a user must hold, when restricted to one package.
    pub required_package: Option<i64>,
}

/// Lifecycle of a purchased package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    /// Usable until `expired_at`.
    Active,
    /// No longer usable.
    Expired,
}

impl PackageStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            other => Err(StoreError::InvalidEnum {
                field: "package status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A package held by a user, with its attempt quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPackage {
    /// Row identifier of this holding.
    pub id: i64,
    /// Holder.
    pub user_id: i64,
    /// Catalogue package identifier.
    pub package_id: i64,
    /// Attempts the package entitles the user to.
    pub tryout_quota: u32,
    /// Attempts already consumed.
    pub tryout_used: u32,
    /// Lifecycle status.
    pub status: PackageStatus,
    /// End of validity.
    pub expired_at: DateTime<Utc>,
}

impl UserPackage {
    /// Active and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == PackageStatus::Active && self.expired_at > now
    }

    /// Live with at least one unused attempt.
    pub fn has_remaining(&self, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.tryout_used < self.tryout_quota
    }
}

/// One row of the attempt ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempting user.
    pub user_id: i64,
    /// Attempted tryout.
    pub tryout_id: i64,
    /// Sequential number per (user, tryout).
    pub attempt_number: u32,
    /// Package holding charged for this attempt; `None` for free tryouts.
    pub user_package_id: Option<i64>,
    /// When the attempt was granted.
    pub started_at: DateTime<Utc>,
}

/// Kind of access-log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    /// Token verification at a stage boundary.
    Access,
    /// Attempt start (quota check and deduction).
    Start,
    /// Manual submission.
    Submit,
    /// Expiry-triggered submission.
    Expire,
}

impl AccessAction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Start => "start",
            Self::Submit => "submit",
            Self::Expire => "expire",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised action.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "access" => Ok(Self::Access),
            "start" => Ok(Self::Start),
            "submit" => Ok(Self::Submit),
            "expire" => Ok(Self::Expire),
            other => Err(StoreError::InvalidEnum {
                field: "action",
                value: other.to_owned(),
            }),
        }
    }
}

/// One append-only access-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Acting user.
    pub user_id: i64,
    /// Target tryout.
    pub tryout_id: i64,
    /// What was attempted.
    pub action: AccessAction,
    /// Whether it was allowed / succeeded.
    pub success: bool,
    /// Machine-readable denial or failure reason.
    pub reason: Option<String>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl AccessLogEntry {
    /// Successful entry stamped now.
    pub fn allowed(user_id: i64, tryout_id: i64, action: AccessAction) -> Self {
        Self {
            user_id,
            tryout_id,
            action,
            success: true,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed entry with a reason, stamped now.
    pub fn denied(
        user_id: i64,
        tryout_id: i64,
        action: AccessAction,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            tryout_id,
            action,
            success: false,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Final answers handed to the store on submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Session being submitted.
    pub session_id: String,
    /// Answers keyed by question id.
    pub answers: BTreeMap<i64, String>,
    /// Client-estimated seconds spent.
    pub time_spent_seconds: u32,
    /// Seconds past duration plus grace, measured on the server clock.
    pub overtime_seconds: u32,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

/// The single stored submission of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Submitted session.
    pub session_id: String,
    /// Answers as first submitted.
    pub answers: BTreeMap<i64, String>,
    /// Client-estimated seconds spent.
    pub time_spent_seconds: u32,
    /// Server-measured overtime.
    pub overtime_seconds: u32,
    /// First submission time.
    pub submitted_at: DateTime<Utc>,
}

/// Result of an idempotent submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// The stored submission (the first one, on repeats).
    pub record: SubmissionRecord,
    /// `false` when the session had already been submitted.
    pub newly_submitted: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session no longer accepts writes.
    #[error("session {0} is not in progress")]
    SessionClosed(String),

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt {field}: {detail}")]
    Corrupt {
        /// Which field failed to decode.
        field: &'static str,
        /// Decoder message.
        detail: String,
    },

    /// The backing service could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Sessions, answers, bookmarks and submissions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the session, or return the existing one for the same
    /// (tryout, user, attempt number).
    async fn create_or_resume_session(&self, seed: &NewSession) -> Result<Session, StoreError>;

    /// Fetch a session by id.
    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Fetch questions, saved answers and bookmarks for a session.
    async fn fetch_workspace(&self, session_id: &str) -> Result<Workspace, StoreError>;

    /// Persist the countdown. Applies only while in progress and only when
    /// lower than the stored value; returns whether the row changed.
    async fn update_time_remaining(&self, session_id: &str, seconds: u32)
        -> Result<bool, StoreError>;

    /// Insert or replace one answer.
    async fn upsert_answer(
        &self,
        session_id: &str,
        question_id: i64,
        answer: &str,
    ) -> Result<(), StoreError>;

    /// Replace the whole bookmark set.
    async fn replace_bookmarks(
        &self,
        session_id: &str,
        question_ids: &BTreeSet<i64>,
    ) -> Result<(), StoreError>;

    /// Mark the session completed and store its submission. Repeats return
    /// the first stored submission unchanged.
    async fn submit_session(&self, request: &SubmitRequest) -> Result<SubmitOutcome, StoreError>;
}

/// Packages, quota and the attempt ledger.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// All packages held by a user, live or not.
    async fn user_packages(&self, user_id: i64) -> Result<Vec<UserPackage>, StoreError>;

    /// Atomically consume one unit of quota from the earliest-expiring live
    /// package (optionally restricted to `package_id`). Returns the holding
    /// row id, or `None` when nothing is left.
    async fn consume_quota(
        &self,
        user_id: i64,
        package_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError>;

    /// Number of attempts already recorded.
    async fn count_attempts(&self, user_id: i64, tryout_id: i64) -> Result<u32, StoreError>;

    /// Append an attempt to the ledger and return its assigned number.
    async fn record_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        user_package_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Consume one unit of quota and append the attempt in one transaction.
    /// Returns `None`, with nothing written, when no eligible package has
    /// quota left. A failed ledger write leaves the quota untouched.
    async fn charge_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        package_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<Option<AttemptRecord>, StoreError>;

    /// Remove an attempt from the ledger and return its unit of quota to the
    /// holding it was charged to. Returns whether the attempt existed.
    async fn void_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
        attempt_number: u32,
    ) -> Result<bool, StoreError>;
}

/// Read-only tryout metadata.
#[async_trait]
pub trait TryoutCatalog: Send + Sync {
    /// Look up a tryout.
    async fn tryout(&self, tryout_id: i64) -> Result<Option<Tryout>, StoreError>;
}

/// Append-only access log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: &AccessLogEntry) -> Result<(), StoreError>;
}
