//! Session lifecycle: create from a verified access token, resume, submit.
//!
//! One session exists per (tryout, user, attempt number). Presenting the same
//! access token twice resumes the first session instead of opening a second.
//! Submission is idempotent at the store; repeats return the first record and
//! a submission token minted from it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::audit::AuditLog;
use crate::storage::{
    AccessAction, AccessLogEntry, NewSession, Session, SessionStatus, SessionStore, StoreError,
    SubmissionRecord, SubmitRequest,
};
use crate::token::{AccessClaims, TokenError, TokenSigner};

/// What caused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTrigger {
    /// The user pressed submit.
    Manual,
    /// The countdown reached zero.
    Expiry,
}

impl SubmitTrigger {
    /// Access-log action recorded for this trigger.
    pub fn action(self) -> AccessAction {
        match self {
            Self::Manual => AccessAction::Submit,
            Self::Expiry => AccessAction::Expire,
        }
    }
}

/// A stored submission plus the token that carries it to the result stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Tryout of the submitted session.
    pub tryout_id: i64,
    /// The stored submission (the first one, on repeats).
    pub record: SubmissionRecord,
    /// `false` when this call found the session already submitted.
    pub newly_submitted: bool,
    /// Signed submission token for the result route.
    pub submission_token: String,
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The attempt this token grants was already submitted.
    #[error("attempt already completed in session {0}")]
    AlreadyCompleted(String),

    /// Tryouts must last at least one minute.
    #[error("invalid tryout duration: {0} minutes")]
    InvalidDuration(u32),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Submission token minting failed.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Creates, resumes and submits attempt sessions.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    signer: Arc<TokenSigner>,
    audit: AuditLog,
    submit_grace: Duration,
}

impl fmt::Debug for SessionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionService")
            .field("submit_grace", &self.submit_grace)
            .finish_non_exhaustive()
    }
}

impl SessionService {
    /// Create a service. `submit_grace` is the slack past the exam duration
    /// before a submission counts as overtime.
    pub fn new(
        store: Arc<dyn SessionStore>,
        signer: Arc<TokenSigner>,
        audit: AuditLog,
        submit_grace: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            audit,
            submit_grace,
        }
    }

    /// The underlying store, shared with runtimes.
    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    /// The signer used for submission tokens.
    pub fn signer(&self) -> Arc<TokenSigner> {
        Arc::clone(&self.signer)
    }

    /// Open the session granted by a freshly verified access token.
    ///
    /// The session starts `in_progress` with the full duration remaining.
    /// If the same attempt already has a session it is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidDuration`] for a zero duration and
    /// [`SessionError::AlreadyCompleted`] when the attempt was submitted.
    pub async fn create_tryout_session(
        &self,
        claims: &AccessClaims,
        duration_minutes: u32,
        kategori_id: Option<i64>,
    ) -> Result<Session, SessionError> {
        if duration_minutes == 0 {
            return Err(SessionError::InvalidDuration(duration_minutes));
        }

        let seed = NewSession {
            session_id: Uuid::new_v4().to_string(),
            tryout_id: claims.tryout_id,
            user_id: claims.user_id,
            attempt_number: claims.attempt_number,
            kategori_id,
            duration_seconds: duration_minutes.saturating_mul(60),
            started_at: Utc::now(),
        };
        let session = self.store.create_or_resume_session(&seed).await?;

        if session.status == SessionStatus::Completed {
            return Err(SessionError::AlreadyCompleted(session.session_id));
        }
        if session.session_id == seed.session_id {
            info!(
                session_id = %session.session_id,
                tryout_id = session.tryout_id,
                user_id = session.user_id,
                attempt_number = session.attempt_number,
                duration_seconds = session.duration_seconds,
                "session created"
            );
        } else {
            debug!(
                session_id = %session.session_id,
                time_remaining = session.time_remaining_seconds,
                "session resumed from repeated token"
            );
        }
        Ok(session)
    }

    /// Fetch an existing session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] when no such session exists.
    pub async fn resume(&self, session_id: &str) -> Result<Session, SessionError> {
        self.store
            .fetch_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_owned()))
    }

    /// Submit a session's final answers.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`], a storage error, or a token error.
    pub async fn submit(
        &self,
        session_id: &str,
        answers: BTreeMap<i64, String>,
        time_spent_seconds: u32,
        trigger: SubmitTrigger,
    ) -> Result<SubmitReceipt, SessionError> {
        self.submit_at(session_id, answers, time_spent_seconds, trigger, Utc::now())
            .await
    }

    /// [`submit`](Self::submit) as of `now`.
    ///
    /// Elapsed wall time is measured from the session's `started_at` on the
    /// server clock. Time past duration plus grace is stored as overtime and
    /// logged; the submission is still accepted.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn submit_at(
        &self,
        session_id: &str,
        answers: BTreeMap<i64, String>,
        time_spent_seconds: u32,
        trigger: SubmitTrigger,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SessionError> {
        let session = self.resume(session_id).await?;
        let overtime_seconds = overtime(
            session.started_at,
            session.duration_seconds,
            self.submit_grace,
            now,
        );

        let request = SubmitRequest {
            session_id: session_id.to_owned(),
            answers,
            time_spent_seconds,
            overtime_seconds,
            submitted_at: now,
        };
        let outcome = match self.store.submit_session(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.audit.record(AccessLogEntry::denied(
                    session.user_id,
                    session.tryout_id,
                    trigger.action(),
                    "submit_failed",
                ));
                return Err(e.into());
            }
        };

        if outcome.newly_submitted {
            if outcome.record.overtime_seconds > 0 {
                warn!(
                    session_id,
                    overtime_seconds = outcome.record.overtime_seconds,
                    "submission past allowed time"
                );
            }
            info!(
                session_id,
                tryout_id = session.tryout_id,
                answered = outcome.record.answers.len(),
                ?trigger,
                "session submitted"
            );
            self.audit.record(AccessLogEntry::allowed(
                session.user_id,
                session.tryout_id,
                trigger.action(),
            ));
        } else {
            debug!(session_id, "repeat submission, returning stored result");
        }

        let submission_token = self.signer.issue_submission_at(
            session.tryout_id,
            session_id,
            outcome.record.answers.clone(),
            outcome.record.time_spent_seconds,
            now,
        )?;

        Ok(SubmitReceipt {
            tryout_id: session.tryout_id,
            record: outcome.record,
            newly_submitted: outcome.newly_submitted,
            submission_token,
        })
    }
}

/// Seconds past `duration + grace` since `started_at`, never negative.
fn overtime(
    started_at: DateTime<Utc>,
    duration_seconds: u32,
    grace: Duration,
    now: DateTime<Utc>,
) -> u32 {
    let elapsed = now.signed_duration_since(started_at).num_seconds();
    let grace = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
    let allowed = i64::from(duration_seconds).saturating_add(grace);
    let over = elapsed.saturating_sub(allowed).max(0);
    u32::try_from(over).unwrap_or(u32::MAX)
}
