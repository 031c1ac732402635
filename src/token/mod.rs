//! Capability tokens for attempt entry and result delivery.
//!
//! A token is `base64url(payload_json) "." base64url(hmac_sha256(first_part))`
//! where the payload is `{"kind": ..., "claims": {...}}`. The `kind` tag keeps
//! an access token from being accepted where a submission token is expected,
//! and vice versa. Verification needs only the signing secret, no server
//! round trip.
//!
//! Checks run in a fixed order: structure, signature, kind, expiry, route.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::TokensConfig;
use crate::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims of an access token: entry into one attempt of one tryout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Tryout the holder may enter.
    pub tryout_id: i64,
    /// Holder.
    pub user_id: i64,
    /// Attempt number granted by the gate.
    pub attempt_number: u32,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Exclusive expiry.
    pub expires_at: DateTime<Utc>,
}

/// Claims of a submission token: a finished attempt's answers on their way
/// to the result stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionClaims {
    /// Tryout the answers belong to.
    pub tryout_id: i64,
    /// Submitted session.
    pub session_id: String,
    /// Final answers keyed by question id.
    pub answers: BTreeMap<i64, String>,
    /// Client-estimated seconds spent.
    pub time_spent_seconds: u32,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Exclusive expiry.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TokenKind {
    Access,
    Submission,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Submission => "submission",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    kind: TokenKind,
    claims: T,
}

/// Peeked before the full decode so a wrong kind reports as such rather
/// than as a claims parse failure.
#[derive(Deserialize)]
struct Header {
    kind: TokenKind,
}

/// Errors from token issuance and verification.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Token is not two base64url parts or the payload does not decode.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Signature does not match the payload.
    #[error("token signature mismatch")]
    BadSignature,

    /// A token of another kind was presented.
    #[error("expected {expected} token, found {found}")]
    WrongKind {
        /// Kind required at this boundary.
        expected: &'static str,
        /// Kind actually presented.
        found: &'static str,
    },

    /// `now` is at or past the token's expiry.
    #[error("token expired at {expired_at}")]
    Expired {
        /// When the token stopped being valid.
        expired_at: DateTime<Utc>,
    },

    /// Token was minted for a different tryout than the route.
    #[error("token is for tryout {found}, route is tryout {expected}")]
    TryoutMismatch {
        /// Tryout of the route being entered.
        expected: i64,
        /// Tryout inside the token.
        found: i64,
    },

    /// Signing secret shorter than [`MIN_SECRET_LEN`].
    #[error("signing secret too short: {len} bytes, need at least {min}")]
    WeakSecret {
        /// Provided length.
        len: usize,
        /// Required length.
        min: usize,
    },

    /// The HMAC implementation refused the key.
    #[error("signing key rejected by HMAC")]
    InvalidKey,

    /// Claims could not be serialized.
    #[error("failed to encode claims: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TokenError {
    /// Short machine-readable reason for access logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "token_malformed",
            Self::BadSignature => "token_bad_signature",
            Self::WrongKind { .. } => "token_wrong_kind",
            Self::Expired { .. } => "token_expired",
            Self::TryoutMismatch { .. } => "token_tryout_mismatch",
            Self::WeakSecret { .. } => "token_weak_secret",
            Self::InvalidKey => "token_invalid_key",
            Self::Encode(_) => "token_encode_failed",
        }
    }
}

/// Issues and verifies signed tokens with one HMAC key.
#[derive(Clone)]
pub struct TokenSigner {
    keyed: HmacSha256,
    access_ttl: chrono::Duration,
    submission_ttl: chrono::Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("key", &"[REDACTED]")
            .field("access_ttl", &self.access_ttl)
            .field("submission_ttl", &self.submission_ttl)
            .finish()
    }
}

impl TokenSigner {
    /// Create a signer.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::WeakSecret`] when the secret is too short and
    /// [`TokenError::InvalidKey`] when HMAC rejects it.
    pub fn new(
        secret: &[u8],
        access_ttl: Duration,
        submission_ttl: Duration,
    ) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret {
                len: secret.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self {
            keyed: <HmacSha256 as KeyInit>::new_from_slice(secret)
                .map_err(|_| TokenError::InvalidKey)?,
            access_ttl: to_chrono(access_ttl),
            submission_ttl: to_chrono(submission_ttl),
        })
    }

    /// Build a signer from config and the secret named by `secret_env`.
    ///
    /// # Errors
    ///
    /// Returns an error when the secret is missing or too short.
    pub fn from_config(config: &TokensConfig, credentials: &Credentials) -> anyhow::Result<Self> {
        let secret = credentials.require(&config.secret_env)?;
        Ok(Self::new(
            secret.as_bytes(),
            config.access_ttl(),
            config.submission_ttl(),
        )?)
    }

    // -- Access tokens --

    /// Mint an access token valid from now for the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if the claims cannot be serialized.
    pub fn generate_access_token(
        &self,
        tryout_id: i64,
        user_id: i64,
        attempt_number: u32,
    ) -> Result<String, TokenError> {
        self.issue_access_at(tryout_id, user_id, attempt_number, Utc::now())
    }

    /// Mint an access token as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if the claims cannot be serialized.
    pub fn issue_access_at(
        &self,
        tryout_id: i64,
        user_id: i64,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        self.seal(
            TokenKind::Access,
            &AccessClaims {
                tryout_id,
                user_id,
                attempt_number,
                issued_at: now,
                expires_at: expiry(now, self.access_ttl),
            },
        )
    }

    /// Verify an access token's structure, signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.verify_access_at(token, Utc::now())
    }

    /// [`verify_access_token`](Self::verify_access_token) as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify_access_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenError> {
        let claims: AccessClaims = self.open(token, TokenKind::Access)?;
        check_expiry(claims.expires_at, now)?;
        Ok(claims)
    }

    /// Verify an access token and bind it to the route's tryout.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::TryoutMismatch`] when the token is valid but
    /// minted for another tryout, or the first failed generic check.
    pub fn verify_for_tryout(
        &self,
        token: &str,
        route_tryout_id: i64,
    ) -> Result<AccessClaims, TokenError> {
        self.verify_for_tryout_at(token, route_tryout_id, Utc::now())
    }

    /// [`verify_for_tryout`](Self::verify_for_tryout) as of `now`.
    ///
    /// # Errors
    ///
    /// See [`verify_for_tryout`](Self::verify_for_tryout).
    pub fn verify_for_tryout_at(
        &self,
        token: &str,
        route_tryout_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenError> {
        let claims = self.verify_access_at(token, now)?;
        check_route(claims.tryout_id, route_tryout_id)?;
        Ok(claims)
    }

    // -- Submission tokens --

    /// Mint a submission token valid from now for the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if the claims cannot be serialized.
    pub fn generate_submission_token(
        &self,
        tryout_id: i64,
        session_id: &str,
        answers: BTreeMap<i64, String>,
        time_spent_seconds: u32,
    ) -> Result<String, TokenError> {
        self.issue_submission_at(tryout_id, session_id, answers, time_spent_seconds, Utc::now())
    }

    /// Mint a submission token as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if the claims cannot be serialized.
    pub fn issue_submission_at(
        &self,
        tryout_id: i64,
        session_id: &str,
        answers: BTreeMap<i64, String>,
        time_spent_seconds: u32,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        self.seal(
            TokenKind::Submission,
            &SubmissionClaims {
                tryout_id,
                session_id: session_id.to_owned(),
                answers,
                time_spent_seconds,
                issued_at: now,
                expires_at: expiry(now, self.submission_ttl),
            },
        )
    }

    /// Verify a submission token's structure, signature and expiry. The
    /// caller must still compare `tryout_id` with its route, or use
    /// [`verify_submission_for_tryout`](Self::verify_submission_for_tryout).
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify_submission_token(&self, token: &str) -> Result<SubmissionClaims, TokenError> {
        self.verify_submission_at(token, Utc::now())
    }

    /// [`verify_submission_token`](Self::verify_submission_token) as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify_submission_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmissionClaims, TokenError> {
        let claims: SubmissionClaims = self.open(token, TokenKind::Submission)?;
        check_expiry(claims.expires_at, now)?;
        Ok(claims)
    }

    /// Verify a submission token and bind it to the result route's tryout.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::TryoutMismatch`] or the first failed generic check.
    pub fn verify_submission_for_tryout(
        &self,
        token: &str,
        route_tryout_id: i64,
    ) -> Result<SubmissionClaims, TokenError> {
        let claims = self.verify_submission_token(token)?;
        check_route(claims.tryout_id, route_tryout_id)?;
        Ok(claims)
    }

    // -- Encoding --

    fn seal<T: Serialize>(&self, kind: TokenKind, claims: &T) -> Result<String, TokenError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Envelope { kind, claims })?);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes()));
        Ok(format!("{payload}.{signature}"))
    }

    fn open<T: DeserializeOwned>(&self, token: &str, expected: TokenKind) -> Result<T, TokenError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("missing signature separator".to_owned()))?;
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| TokenError::Malformed(format!("signature encoding: {e}")))?;

        let computed = self.mac(payload.as_bytes());
        if computed.len() != provided.len() || !bool::from(computed.ct_eq(provided.as_slice())) {
            return Err(TokenError::BadSignature);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenError::Malformed(format!("payload encoding: {e}")))?;
        let header: Header = serde_json::from_slice(&raw)
            .map_err(|e| TokenError::Malformed(format!("header: {e}")))?;
        if header.kind != expected {
            return Err(TokenError::WrongKind {
                expected: expected.as_str(),
                found: header.kind.as_str(),
            });
        }
        let envelope: Envelope<T> = serde_json::from_slice(&raw)
            .map_err(|e| TokenError::Malformed(format!("claims: {e}")))?;
        Ok(envelope.claims)
    }

    fn mac(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = self.keyed.clone();
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Short hex digest identifying a token in logs without revealing it.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest.get(..8).unwrap_or_default())
}

fn check_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), TokenError> {
    if now < expires_at {
        Ok(())
    } else {
        Err(TokenError::Expired {
            expired_at: expires_at,
        })
    }
}

fn check_route(found: i64, expected: i64) -> Result<(), TokenError> {
    if found == expected {
        Ok(())
    } else {
        Err(TokenError::TryoutMismatch { expected, found })
    }
}

fn expiry(now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}
