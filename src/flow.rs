//! Stage machine for one user's path through an attempt.
//!
//! ```text
//! NoToken -> TokenIssued -> AccessVerified -> SessionCreated -> Submitted -> ResultVerified
//! ```
//!
//! Every boundary re-verifies the token it is handed. Any verification
//! failure drops the flow back to [`Stage::NoToken`] and records a failed
//! `access` entry with the reason; there is no retry in place.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::access::audit::AuditLog;
use crate::access::{AccessError, AccessGate, AttemptGrant};
use crate::config::RuntimeConfig;
use crate::runtime::{ExamRuntime, ResultStage};
use crate::session::{SessionError, SessionService};
use crate::storage::{AccessAction, AccessLogEntry, Session, StoreError};
use crate::token::{fingerprint, AccessClaims, SubmissionClaims, TokenError, TokenSigner};

/// Where the user is in the attempt flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Nothing granted yet, or a check failed.
    NoToken,
    /// The gate passed and minted an access token.
    TokenIssued,
    /// The token was verified at the intro screen.
    AccessVerified,
    /// A session is running.
    SessionCreated,
    /// The session was submitted.
    Submitted,
    /// The submission token was verified at the result screen.
    ResultVerified,
}

impl Stage {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::TokenIssued => "token_issued",
            Self::AccessVerified => "access_verified",
            Self::SessionCreated => "session_created",
            Self::Submitted => "submitted",
            Self::ResultVerified => "result_verified",
        }
    }
}

/// Errors from flow transitions.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The action is not valid from the current stage.
    #[error("cannot {action} from stage {}", from.as_str())]
    InvalidTransition {
        /// Stage the flow was in.
        from: Stage,
        /// Attempted action.
        action: &'static str,
    },

    /// The gate refused or failed.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// A token failed verification.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A valid token presented by someone other than its holder.
    #[error("token belongs to user {found}, not {expected}")]
    UserMismatch {
        /// User driving this flow.
        expected: i64,
        /// User inside the token.
        found: i64,
    },

    /// A submission result for a different session than the one running.
    #[error("result is for session {found}, running {expected}")]
    SessionMismatch {
        /// Session created by this flow.
        expected: String,
        /// Session named by the result.
        found: String,
    },

    /// The route's tryout does not exist.
    #[error("tryout {0} not found")]
    TryoutNotFound(i64),

    /// Session creation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FlowError {
    /// Short machine-readable reason for access logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Access(AccessError::Denied(reason)) => reason.as_str(),
            Self::Access(_) => "access_failed",
            Self::Token(e) => e.reason(),
            Self::UserMismatch { .. } => "token_user_mismatch",
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::TryoutNotFound(_) => "tryout_not_found",
            Self::Session(SessionError::AlreadyCompleted(_)) => "attempt_completed",
            Self::Session(_) => "session_failed",
            Self::Store(_) => "store_failed",
        }
    }
}

/// One user's attempt flow. Owned per request/session; nothing is global.
#[derive(Debug)]
pub struct AttemptFlow {
    gate: Arc<AccessGate>,
    sessions: SessionService,
    signer: Arc<TokenSigner>,
    audit: AuditLog,
    user_id: i64,
    stage: Stage,
    token: Option<String>,
    claims: Option<AccessClaims>,
    session: Option<Session>,
    result: Option<ResultStage>,
    verified: Option<SubmissionClaims>,
}

impl AttemptFlow {
    /// Start a flow for `user_id` at [`Stage::NoToken`].
    pub fn new(
        gate: Arc<AccessGate>,
        sessions: SessionService,
        audit: AuditLog,
        user_id: i64,
    ) -> Self {
        Self {
            gate,
            signer: sessions.signer(),
            sessions,
            audit,
            user_id,
            stage: Stage::NoToken,
            token: None,
            claims: None,
            session: None,
            result: None,
            verified: None,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Access token issued by [`enter`](Self::enter), if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Claims verified at the intro stage.
    pub fn claims(&self) -> Option<&AccessClaims> {
        self.claims.as_ref()
    }

    /// Session created by [`begin`](Self::begin).
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Submission recorded from the runtime.
    pub fn result(&self) -> Option<&ResultStage> {
        self.result.as_ref()
    }

    /// Submission claims verified at the result stage.
    pub fn verified_result(&self) -> Option<&SubmissionClaims> {
        self.verified.as_ref()
    }

    /// Pass the gate for `tryout_id`: check, charge and mint.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Access`] on denial; the flow stays at `NoToken`.
    pub async fn enter(&mut self, tryout_id: i64) -> Result<AttemptGrant, FlowError> {
        self.expect_stage(&[Stage::NoToken, Stage::ResultVerified], "enter")?;
        self.reset();
        match self.gate.start_attempt(tryout_id, self.user_id).await {
            Ok(grant) => {
                self.token = Some(grant.token.clone());
                self.advance(Stage::TokenIssued);
                Ok(grant)
            }
            // The gate records its own denials.
            Err(e) => {
                debug!(user_id = self.user_id, tryout_id, error = %e, "flow entry refused");
                Err(e.into())
            }
        }
    }

    /// Verify the access token on the intro route for `route_tryout_id`.
    ///
    /// # Errors
    ///
    /// Any verification failure resets the flow to `NoToken`.
    pub fn open_intro(
        &mut self,
        token: &str,
        route_tryout_id: i64,
    ) -> Result<AccessClaims, FlowError> {
        self.expect_stage(&[Stage::NoToken, Stage::TokenIssued], "open intro")?;
        let claims = match self.verify_access(token, route_tryout_id) {
            Ok(claims) => claims,
            Err(e) => return Err(self.fail(route_tryout_id, token, e)),
        };
        self.audit.record(AccessLogEntry::allowed(
            self.user_id,
            route_tryout_id,
            AccessAction::Access,
        ));
        self.token = Some(token.to_owned());
        self.claims = Some(claims.clone());
        self.advance(Stage::AccessVerified);
        Ok(claims)
    }

    /// Re-verify the token and create the session for the route's tryout.
    ///
    /// # Errors
    ///
    /// Any verification or creation failure resets the flow to `NoToken`.
    pub async fn begin(
        &mut self,
        token: &str,
        route_tryout_id: i64,
        kategori_id: Option<i64>,
    ) -> Result<Session, FlowError> {
        self.expect_stage(&[Stage::AccessVerified], "begin")?;
        match self.create_session(token, route_tryout_id, kategori_id).await {
            Ok(session) => {
                self.session = Some(session.clone());
                self.advance(Stage::SessionCreated);
                Ok(session)
            }
            Err(e) => Err(self.fail(route_tryout_id, token, e)),
        }
    }

    /// A runtime for the created session.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidTransition`] before a session exists.
    pub fn runtime(&self, config: &RuntimeConfig) -> Result<ExamRuntime, FlowError> {
        match (&self.session, self.stage) {
            (Some(session), Stage::SessionCreated) => Ok(ExamRuntime::new(
                session.session_id.clone(),
                self.sessions.clone(),
                config,
            )),
            _ => Err(FlowError::InvalidTransition {
                from: self.stage,
                action: "open runtime",
            }),
        }
    }

    /// Record the runtime's submission result.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is running or the result names
    /// another session.
    pub fn record_submission(&mut self, result: ResultStage) -> Result<(), FlowError> {
        self.expect_stage(&[Stage::SessionCreated], "record submission")?;
        let expected = self
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        if result.session_id != expected {
            return Err(FlowError::SessionMismatch {
                expected,
                found: result.session_id,
            });
        }
        self.result = Some(result);
        self.advance(Stage::Submitted);
        Ok(())
    }

    /// Verify the submission token on the result route for `route_tryout_id`.
    ///
    /// # Errors
    ///
    /// Any verification failure resets the flow to `NoToken`.
    pub fn open_result(
        &mut self,
        submission_token: &str,
        route_tryout_id: i64,
    ) -> Result<SubmissionClaims, FlowError> {
        self.expect_stage(&[Stage::Submitted], "open result")?;
        let claims = match self
            .signer
            .verify_submission_for_tryout(submission_token, route_tryout_id)
        {
            Ok(claims) => claims,
            Err(e) => return Err(self.fail(route_tryout_id, submission_token, e.into())),
        };
        self.audit.record(AccessLogEntry::allowed(
            self.user_id,
            route_tryout_id,
            AccessAction::Access,
        ));
        self.verified = Some(claims.clone());
        self.advance(Stage::ResultVerified);
        Ok(claims)
    }

    /// Drop everything and return to `NoToken`.
    pub fn reset(&mut self) {
        self.stage = Stage::NoToken;
        self.token = None;
        self.claims = None;
        self.session = None;
        self.result = None;
        self.verified = None;
    }

    fn verify_access(&self, token: &str, route_tryout_id: i64) -> Result<AccessClaims, FlowError> {
        let claims = self.signer.verify_for_tryout(token, route_tryout_id)?;
        if claims.user_id != self.user_id {
            return Err(FlowError::UserMismatch {
                expected: self.user_id,
                found: claims.user_id,
            });
        }
        Ok(claims)
    }

    async fn create_session(
        &self,
        token: &str,
        route_tryout_id: i64,
        kategori_id: Option<i64>,
    ) -> Result<Session, FlowError> {
        let claims = self.verify_access(token, route_tryout_id)?;
        let tryout = self
            .gate
            .tryout(route_tryout_id)
            .await?
            .ok_or(FlowError::TryoutNotFound(route_tryout_id))?;
        Ok(self
            .sessions
            .create_tryout_session(&claims, tryout.duration_minutes, kategori_id)
            .await?)
    }

    fn expect_stage(&self, allowed: &[Stage], action: &'static str) -> Result<(), FlowError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: self.stage,
                action,
            })
        }
    }

    fn advance(&mut self, to: Stage) {
        debug!(
            user_id = self.user_id,
            from = self.stage.as_str(),
            to = to.as_str(),
            "flow advanced"
        );
        self.stage = to;
        if to == Stage::ResultVerified {
            info!(user_id = self.user_id, "attempt flow completed");
        }
    }

    fn fail(&mut self, tryout_id: i64, token: &str, error: FlowError) -> FlowError {
        warn!(
            user_id = self.user_id,
            tryout_id,
            token = %fingerprint(token),
            stage = self.stage.as_str(),
            reason = error.reason(),
            "flow check failed, back to no token"
        );
        self.audit.record(AccessLogEntry::denied(
            self.user_id,
            tryout_id,
            AccessAction::Access,
            error.reason(),
        ));
        self.reset();
        error
    }
}
