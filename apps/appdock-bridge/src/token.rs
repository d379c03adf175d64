//! Issues and verifies the HMAC-signed access tokens that gate every
//! protected surface.
//!
//! There is exactly one identity (the configured username) and no revocation
//! list: a token dies when its `exp` passes. Refreshing mints a new token for
//! the same subject; the old one stays valid until its own expiry.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::AuthSettings;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;
const ACCEPTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Informational; tokens are not rejected on issuer.
    #[serde(default)]
    pub iss: String,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// A signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub claims: Claims,
}

impl AccessToken {
    /// Lifetime in seconds, as reported to clients.
    pub fn expires_in(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTokenReason {
    Malformed,
    BadSignature,
    WrongAlgorithm,
    Expired,
}

impl InvalidTokenReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            InvalidTokenReason::Malformed => "malformed",
            InvalidTokenReason::BadSignature => "bad_signature",
            InvalidTokenReason::WrongAlgorithm => "wrong_algorithm",
            InvalidTokenReason::Expired => "expired",
        }
    }
}

impl fmt::Display for InvalidTokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_label())
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid or expired token ({0})")]
    InvalidToken(InvalidTokenReason),
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for InvalidTokenReason {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => InvalidTokenReason::BadSignature,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                InvalidTokenReason::WrongAlgorithm
            }
            ErrorKind::ExpiredSignature => InvalidTokenReason::Expired,
            _ => InvalidTokenReason::Malformed,
        }
    }
}

pub struct TokenAuthority {
    settings: Arc<AuthSettings>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenAuthority {
    pub fn new(settings: Arc<AuthSettings>) -> Self {
        let encoding = EncodingKey::from_secret(&settings.jwt_secret);
        let decoding = DecodingKey::from_secret(&settings.jwt_secret);

        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.algorithms = ACCEPTED_ALGORITHMS.to_vec();
        validation.set_required_spec_claims(&["exp"]);
        // Expiry is compared against the caller's clock in `validate_at`.
        validation.validate_exp = false;
        validation.leeway = 0;

        Self {
            settings,
            encoding,
            decoding,
            validation,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn issue(&self, username: &str, password: &str) -> Result<AccessToken, TokenError> {
        self.issue_at(username, password, Utc::now())
    }

    pub fn issue_at(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, TokenError> {
        if !self.credentials_match(username, password) {
            return Err(TokenError::InvalidCredentials);
        }
        let iat = now.timestamp();
        self.mint(&self.settings.username, iat, iat + self.lifetime_secs())
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| TokenError::InvalidToken(err.into()))?;
        let claims = data.claims;
        if now.timestamp() >= claims.exp {
            return Err(TokenError::InvalidToken(InvalidTokenReason::Expired));
        }
        Ok(claims)
    }

    pub fn refresh(&self, token: &str) -> Result<AccessToken, TokenError> {
        self.refresh_at(token, Utc::now())
    }

    /// Re-issues a still-valid token with a fresh window.
    ///
    /// The new expiry is always strictly after the old one, even when the
    /// refresh lands in the same second the original was minted.
    pub fn refresh_at(&self, token: &str, now: DateTime<Utc>) -> Result<AccessToken, TokenError> {
        let claims = self.validate_at(token, now)?;
        let iat = now.timestamp();
        let exp = (iat + self.lifetime_secs()).max(claims.exp + 1);
        self.mint(&claims.sub, iat, exp)
    }

    fn mint(&self, subject: &str, iat: i64, exp: i64) -> Result<AccessToken, TokenError> {
        let claims = Claims {
            sub: subject.to_string(),
            iat,
            exp,
            iss: self.settings.issuer.clone(),
        };
        let token = encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding)
            .map_err(TokenError::Signing)?;
        Ok(AccessToken { token, claims })
    }

    /// Configured token lifetime in seconds.
    pub fn lifetime_secs(&self) -> i64 {
        self.settings.token_ttl.as_secs() as i64
    }

    /// Compares both fields without short-circuiting so a wrong username and
    /// a wrong password take the same path.
    fn credentials_match(&self, username: &str, password: &str) -> bool {
        let user_ok = self.digest_eq(username.as_bytes(), self.settings.username.as_bytes());
        let pass_ok = self.digest_eq(password.as_bytes(), self.settings.password.as_bytes());
        user_ok & pass_ok
    }

    fn digest_eq(&self, candidate: &[u8], expected: &[u8]) -> bool {
        let Ok(mut expected_mac) = HmacSha256::new_from_slice(&self.settings.jwt_secret) else {
            return false;
        };
        expected_mac.update(expected);
        let expected_tag = expected_mac.finalize().into_bytes();

        let Ok(mut candidate_mac) = HmacSha256::new_from_slice(&self.settings.jwt_secret) else {
            return false;
        };
        candidate_mac.update(candidate);
        candidate_mac.verify_slice(&expected_tag).is_ok()
    }
}
