//! Access control gate: who may start an attempt, and at what cost.
//!
//! Free tryouts always pass. Paid tryouts pass when the user holds at least
//! one live package with unused quota. Starting a paid attempt consumes one
//! unit through [`QuotaStore::charge_attempt`], a conditional update that
//! commits together with the ledger row, so two concurrent starts on the last
//! unit cannot both succeed and a failed start never keeps the unit.

pub mod audit;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::storage::{
    AccessAction, AccessLogEntry, QuotaStore, StoreError, Tryout, TryoutCatalog, UserPackage,
};
use crate::token::{TokenError, TokenSigner};

use self::audit::AuditLog;

/// Why a start was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// No tryout with this id.
    TryoutNotFound,
    /// The user holds no package that covers this tryout.
    NoActivePackage,
    /// Every covering package is past its expiry.
    PackageExpired,
    /// Covering packages are live but fully used.
    QuotaExhausted,
}

impl DenialReason {
    /// Machine-readable code for access logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TryoutNotFound => "tryout_not_found",
            Self::NoActivePackage => "no_active_package",
            Self::PackageExpired => "package_expired",
            Self::QuotaExhausted => "quota_exhausted",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::TryoutNotFound => "tryout not found",
            Self::NoActivePackage => "no active package covers this tryout",
            Self::PackageExpired => "your package has expired",
            Self::QuotaExhausted => "tryout quota exhausted",
        };
        f.write_str(message)
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    /// Whether the user may start.
    pub allowed: bool,
    /// Present iff `allowed` is false.
    pub reason: Option<DenialReason>,
    /// The tryout is free; no quota will be consumed.
    pub free: bool,
}

impl AccessDecision {
    fn allow(free: bool) -> Self {
        Self {
            allowed: true,
            reason: None,
            free,
        }
    }

    fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            free: false,
        }
    }
}

/// A successful start: the access token and what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptGrant {
    /// Signed access token for the intro stage.
    pub token: String,
    /// Tryout granted.
    pub tryout_id: i64,
    /// Attempt number stamped into the token.
    pub attempt_number: u32,
    /// Package holding charged, `None` for free tryouts.
    pub user_package_id: Option<i64>,
}

/// Errors from the access gate.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// Access refused. Not a fault; surfaced to the user.
    #[error("access denied: {0}")]
    Denied(DenialReason),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Token minting failed.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Decides and charges attempt starts.
pub struct AccessGate {
    catalog: Arc<dyn TryoutCatalog>,
    quota: Arc<dyn QuotaStore>,
    signer: Arc<TokenSigner>,
    audit: AuditLog,
}

impl fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGate")
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl AccessGate {
    /// Create a gate over the given collaborators.
    pub fn new(
        catalog: Arc<dyn TryoutCatalog>,
        quota: Arc<dyn QuotaStore>,
        signer: Arc<TokenSigner>,
        audit: AuditLog,
    ) -> Self {
        Self {
            catalog,
            quota,
            signer,
            audit,
        }
    }

    /// Tryout metadata, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the catalogue read fails.
    pub async fn tryout(&self, tryout_id: i64) -> Result<Option<Tryout>, StoreError> {
        self.catalog.tryout(tryout_id).await
    }

    /// Whether `user_id` may start `tryout_id` right now.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if catalogue or package reads fail.
    pub async fn check_access(
        &self,
        tryout_id: i64,
        user_id: i64,
    ) -> Result<AccessDecision, StoreError> {
        self.check_access_at(tryout_id, user_id, Utc::now()).await
    }

    /// [`check_access`](Self::check_access) as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if catalogue or package reads fail.
    pub async fn check_access_at(
        &self,
        tryout_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, StoreError> {
        let Some(tryout) = self.catalog.tryout(tryout_id).await? else {
            return Ok(AccessDecision::deny(DenialReason::TryoutNotFound));
        };
        if tryout.is_free {
            return Ok(AccessDecision::allow(true));
        }

        let packages = self.quota.user_packages(user_id).await?;
        Ok(decide(&tryout, &packages, now))
    }

    /// Number the next attempt would receive: prior attempts + 1. Informational;
    /// attempts are not capped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the ledger read fails.
    pub async fn check_existing_attempt(
        &self,
        user_id: i64,
        tryout_id: i64,
    ) -> Result<u32, StoreError> {
        let prior = self.quota.count_attempts(user_id, tryout_id).await?;
        Ok(prior.saturating_add(1))
    }

    /// Consume one unit of quota for this tryout. Returns the charged holding,
    /// or `None` when no eligible package has quota left.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the catalogue read or the update fails.
    pub async fn deduct_quota(
        &self,
        user_id: i64,
        tryout_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let required = self.required_package(tryout_id).await?;
        self.quota.consume_quota(user_id, required, Utc::now()).await
    }

    async fn required_package(&self, tryout_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(self
            .catalog
            .tryout(tryout_id)
            .await?
            .and_then(|t| t.required_package))
    }

    /// Undo a recorded attempt whose token could not be issued.
    async fn void(&self, user_id: i64, tryout_id: i64, attempt_number: u32) {
        if let Err(e) = self
            .quota
            .void_attempt(user_id, tryout_id, attempt_number)
            .await
        {
            error!(
                user_id,
                tryout_id,
                attempt_number,
                error = %e,
                "failed to void attempt after token error"
            );
        }
    }

    /// Fire-and-forget access-log append.
    pub fn log_access_attempt(&self, entry: AccessLogEntry) {
        self.audit.record(entry);
    }

    /// Check, charge, record and mint: the whole "start" step.
    ///
    /// Denials are logged as failed `start` entries and returned as
    /// [`AccessError::Denied`].
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Denied`] with a reason, or a storage/token error.
    pub async fn start_attempt(
        &self,
        tryout_id: i64,
        user_id: i64,
    ) -> Result<AttemptGrant, AccessError> {
        let now = Utc::now();
        let decision = self.check_access_at(tryout_id, user_id, now).await?;
        if let Some(reason) = decision.reason {
            return Err(self.deny(user_id, tryout_id, reason));
        }

        let (attempt_number, user_package_id) = if decision.free {
            let number = self
                .quota
                .record_attempt(user_id, tryout_id, None, now)
                .await?;
            (number, None)
        } else {
            // The check above can be stale by now; the conditional update is
            // the authority.
            let required = self.required_package(tryout_id).await?;
            match self
                .quota
                .charge_attempt(user_id, tryout_id, required, now)
                .await?
            {
                Some(record) => (record.attempt_number, record.user_package_id),
                None => return Err(self.deny(user_id, tryout_id, DenialReason::QuotaExhausted)),
            }
        };

        let token = match self
            .signer
            .issue_access_at(tryout_id, user_id, attempt_number, now)
        {
            Ok(token) => token,
            Err(e) => {
                self.void(user_id, tryout_id, attempt_number).await;
                return Err(e.into());
            }
        };

        self.log_access_attempt(AccessLogEntry::allowed(
            user_id,
            tryout_id,
            AccessAction::Start,
        ));
        info!(
            user_id,
            tryout_id,
            attempt_number,
            ?user_package_id,
            "attempt started"
        );

        Ok(AttemptGrant {
            token,
            tryout_id,
            attempt_number,
            user_package_id,
        })
    }

    fn deny(&self, user_id: i64, tryout_id: i64, reason: DenialReason) -> AccessError {
        debug!(user_id, tryout_id, reason = reason.as_str(), "attempt start denied");
        self.log_access_attempt(AccessLogEntry::denied(
            user_id,
            tryout_id,
            AccessAction::Start,
            reason.as_str(),
        ));
        AccessError::Denied(reason)
    }
}

/// Pure access decision for a paid tryout over the user's holdings.
fn decide(tryout: &Tryout, packages: &[UserPackage], now: DateTime<Utc>) -> AccessDecision {
    let covering: Vec<&UserPackage> = packages
        .iter()
        .filter(|p| {
            tryout
                .required_package
                .map_or(true, |required| p.package_id == required)
        })
        .collect();

    if covering.iter().any(|p| p.has_remaining(now)) {
        return AccessDecision::allow(false);
    }
    if covering.iter().any(|p| p.is_live(now)) {
        return AccessDecision::deny(DenialReason::QuotaExhausted);
    }
    if covering.is_empty() {
        return AccessDecision::deny(DenialReason::NoActivePackage);
    }
    AccessDecision::deny(DenialReason::PackageExpired)
}
