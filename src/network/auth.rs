//! Caller Authentication
//!
//! A connection proves who it is once, with a JWT from the operator's
//! identity provider. The `sub` claim is the caller's identity; its ledger
//! account is [`AccountId::derive`] of that subject, the same mapping used
//! for `EVEN_ODD_OPERATOR`. The server never issues tokens.

use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::core::account::AccountId;

/// Default clock skew tolerated on `exp`, in seconds.
const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Key that signs caller tokens.
#[derive(Clone, Debug)]
pub enum TokenKey {
    /// Shared HS256 secret.
    Hs256(String),
    /// RS256 public key, PEM encoded.
    Rs256(String),
}

impl TokenKey {
    fn decoding_key(&self) -> Result<(Algorithm, DecodingKey), AuthError> {
        match self {
            TokenKey::Hs256(secret) => Ok((Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes()))),
            TokenKey::Rs256(pem) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|key| (Algorithm::RS256, key))
                .map_err(|e| AuthError::InvalidKey(e.to_string())),
        }
    }
}

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Token signing key. `None` leaves the server without verification.
    pub key: Option<TokenKey>,
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Required `aud`, if any.
    pub audience: Option<String>,
    /// Seconds a token stays acceptable past its `exp`.
    pub leeway_secs: u64,
    /// Trust the claimed subject when no key is configured (local dev only).
    pub allow_insecure_dev_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key: None,
            issuer: None,
            audience: None,
            leeway_secs: DEFAULT_LEEWAY_SECS,
            allow_insecure_dev_auth: false,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    ///
    /// `AUTH_PUBLIC_KEY_PEM` takes precedence over `AUTH_SECRET`.
    pub fn from_env() -> Self {
        let key = std::env::var("AUTH_PUBLIC_KEY_PEM")
            .map(TokenKey::Rs256)
            .or_else(|_| std::env::var("AUTH_SECRET").map(TokenKey::Hs256))
            .ok();

        Self {
            key,
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            leeway_secs: std::env::var("AUTH_LEEWAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LEEWAY_SECS),
            allow_insecure_dev_auth: env_flag("AUTH_ALLOW_INSECURE_DEV"),
        }
    }

    /// Whether tokens are verified.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway_secs;
        validation.required_spec_claims = ["sub", "exp"].iter().map(|c| c.to_string()).collect::<HashSet<_>>();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true" || v == "1").unwrap_or(false)
}

/// Claims the server reads. Issuer, audience and expiry are checked by
/// the decoder and not kept.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountClaims {
    /// Caller identity at the provider.
    pub sub: String,
}

impl AccountClaims {
    /// Ledger account of the subject.
    pub fn account_id(&self) -> AccountId {
        AccountId::derive(&self.sub)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No key configured and dev auth is off.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token past its `exp`.
    #[error("token expired")]
    Expired,
    /// Signature does not match the configured key.
    #[error("invalid signature")]
    InvalidSignature,
    /// `iss` or `aud` differs from the configured value.
    #[error("unexpected {0} claim")]
    ClaimMismatch(&'static str),
    /// Required claim absent or empty.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Not a decodable JWT.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Configured key could not be loaded.
    #[error("invalid verification key: {0}")]
    InvalidKey(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::ClaimMismatch("iss"),
            ErrorKind::InvalidAudience => AuthError::ClaimMismatch("aud"),
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => AuthError::InvalidKey(err.to_string()),
            _ => AuthError::Malformed(err.to_string()),
        }
    }
}

/// Resolve the caller's account.
///
/// With a key configured the token must verify and the claimed subject is
/// ignored. Without one the claimed subject is trusted, but only when
/// `allow_insecure_dev_auth` is set.
pub fn authenticate(
    token: &str,
    claimed_subject: Option<&str>,
    config: &AuthConfig,
) -> Result<AccountId, AuthError> {
    match &config.key {
        Some(key) => verify(token, key, config).map(|claims| claims.account_id()),
        None if config.allow_insecure_dev_auth => match claimed_subject {
            Some(subject) if !subject.is_empty() => Ok(AccountId::derive(subject)),
            _ => Err(AuthError::MissingClaim("sub".into())),
        },
        None => Err(AuthError::NotConfigured),
    }
}

fn verify(token: &str, key: &TokenKey, config: &AuthConfig) -> Result<AccountClaims, AuthError> {
    let (algorithm, decoding_key) = key.decoding_key()?;
    let claims = decode::<AccountClaims>(token, &decoding_key, &config.validation(algorithm))?.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};

    const SECRET: &str = "table-secret-at-least-32-bytes!!";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn sign(claims: Value, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn keyed() -> AuthConfig {
        AuthConfig { key: Some(TokenKey::Hs256(SECRET.into())), ..Default::default() }
    }

    #[test]
    fn test_subject_maps_to_derived_account() {
        let token = sign(json!({ "sub": "alice", "exp": now() + 600 }), SECRET);

        let account = authenticate(&token, None, &keyed()).unwrap();
        assert_eq!(account, AccountId::derive("alice"));

        // A verified token wins over whatever the client claims
        let account = authenticate(&token, Some("operator"), &keyed()).unwrap();
        assert_eq!(account, AccountId::derive("alice"));
    }

    #[test]
    fn test_expiry_honours_leeway() {
        let stale = sign(json!({ "sub": "alice", "exp": now() - 3_600 }), SECRET);
        assert!(matches!(authenticate(&stale, None, &keyed()), Err(AuthError::Expired)));

        let just_lapsed = sign(json!({ "sub": "alice", "exp": now() - 5 }), SECRET);
        assert!(authenticate(&just_lapsed, None, &keyed()).is_ok());

        let strict = AuthConfig { leeway_secs: 0, ..keyed() };
        assert!(matches!(authenticate(&just_lapsed, None, &strict), Err(AuthError::Expired)));
    }

    #[test]
    fn test_rejections() {
        let config = AuthConfig {
            issuer: Some("idp".into()),
            audience: Some("even-odd".into()),
            ..keyed()
        };
        let exp = now() + 600;

        let cases = [
            (sign(json!({ "sub": "a", "exp": exp, "iss": "idp", "aud": "even-odd" }), "another-secret-of-32-bytes-long!"), "signature"),
            (sign(json!({ "sub": "a", "exp": exp, "iss": "evil", "aud": "even-odd" }), SECRET), "iss"),
            (sign(json!({ "sub": "a", "exp": exp, "iss": "idp", "aud": "other" }), SECRET), "aud"),
            (sign(json!({ "sub": "a", "iss": "idp", "aud": "even-odd" }), SECRET), "exp"),
            (sign(json!({ "sub": "", "exp": exp, "iss": "idp", "aud": "even-odd" }), SECRET), "sub"),
            ("not.a.jwt".to_string(), "format"),
        ];

        for (token, expected) in cases {
            let err = authenticate(&token, None, &config).unwrap_err();
            let matched = match (&err, expected) {
                (AuthError::InvalidSignature, "signature") => true,
                (AuthError::ClaimMismatch(claim), _) => *claim == expected,
                (AuthError::MissingClaim(claim), _) => claim == expected,
                (AuthError::Malformed(_), "format") => true,
                _ => false,
            };
            assert!(matched, "expected {} rejection, got {:?}", expected, err);
        }
    }

    #[test]
    fn test_unloadable_rsa_key() {
        let config = AuthConfig { key: Some(TokenKey::Rs256("not a pem".into())), ..Default::default() };
        let token = sign(json!({ "sub": "alice", "exp": now() + 600 }), SECRET);

        assert!(matches!(authenticate(&token, None, &config), Err(AuthError::InvalidKey(_))));
    }

    #[test]
    fn test_without_key_dev_mode_only() {
        let closed = AuthConfig::default();
        assert!(!closed.is_configured());
        assert!(matches!(authenticate("", Some("alice"), &closed), Err(AuthError::NotConfigured)));

        let dev = AuthConfig { allow_insecure_dev_auth: true, ..Default::default() };
        assert_eq!(authenticate("", Some("alice"), &dev).unwrap(), AccountId::derive("alice"));
        assert!(matches!(authenticate("", None, &dev), Err(AuthError::MissingClaim(_))));
        assert!(matches!(authenticate("", Some(""), &dev), Err(AuthError::MissingClaim(_))));
    }
}
