#![forbid(unsafe_code)]

//! **insieme-auth** – Authentication and authorization primitives for the
//! Insieme sync core.
//!
//! This crate defines the canonical `Claims` structure and the two key
//! traits – [`TokenVerifier`] and [`PartitionAuthorizer`] – used by the
//! server engine. A simple HS256 JWT implementation (`JwtHs256Verifier`)
//! is bundled; token *issuance* policy stays with the host, only a mint
//! helper for local tooling and tests ships here.
//!
//! Future releases can provide additional algorithms (Biscuit, Paseto, …)
//! while reusing the same trait contracts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authenticated identity extracted from a capability token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable client identifier (the token subject).
    pub client_id: String,
    /// Granted partition scope; `"*"` means every partition.
    pub partitions: Vec<String>,
}

/// Canonical claim set embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject – the client identifier.
    pub sub: String,
    /// Granted partition labels (`"*"` wildcard permitted).
    pub partitions: Vec<String>,
    /// Issued-at timestamp (seconds since Unix epoch).
    pub iat: u64,
    /// Absolute expiry timestamp (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token identifier for replay protection.
    pub jti: String,
}

/// Minimal in-crate error type.
#[derive(Debug)]
pub struct Error {
    msg: String,
}

impl Error {
    /// Wrap a message.
    pub fn new(msg: &str) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.msg.fmt(f)
    }
}

impl std::error::Error for Error {}

/// Crate result helper.
pub type Result<T> = std::result::Result<T, Error>;

//─────────────────────────────
//  Trait definitions
//─────────────────────────────

/// Verifier used by the server session before activating a connection.
///
/// Implementations must reject expired or tampered tokens; the session
/// additionally checks that the claimed `client_id` matches the subject.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify authenticity and return the embedded [`Identity`].
    async fn verify(&self, raw: &str) -> Result<Identity>;
}

/// Authorization policy over partition sets.
#[async_trait]
pub trait PartitionAuthorizer: Send + Sync {
    /// Whether `identity` may read and write all of `partitions`.
    async fn authorize(&self, identity: &Identity, partitions: &[String]) -> Result<bool>;
}

//─────────────────────────────
//  HS256 JWT implementation
//─────────────────────────────

pub mod hs256 {
    use super::{Claims, Error, Identity, Result, TokenVerifier};
    use async_trait::async_trait;
    use jsonwebtoken::{
        decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
    };
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// HS256 JWT verifier.
    #[derive(Clone, Debug)]
    pub struct JwtHs256Verifier {
        secret: String,
        validation: Validation,
    }

    impl JwtHs256Verifier {
        /// Build a verifier over a shared secret.
        pub fn new(secret: impl Into<String>) -> Self {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            validation.set_required_spec_claims(&["exp", "sub"]);
            Self { secret: secret.into(), validation }
        }
    }

    #[async_trait]
    impl TokenVerifier for JwtHs256Verifier {
        async fn verify(&self, raw: &str) -> Result<Identity> {
            let data = decode::<Claims>(
                raw,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &self.validation,
            )
            .map_err(|e| Error::new(&e.to_string()))?;
            Ok(Identity {
                client_id: data.claims.sub,
                partitions: data.claims.partitions,
            })
        }
    }

    /// Helper to construct standard claims with proper timestamps.
    pub fn build_claims(subject: &str, partitions: Vec<String>, ttl_secs: u64) -> Result<Claims> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::new(&e.to_string()))?
            .as_secs();
        Ok(Claims {
            sub: subject.to_owned(),
            partitions,
            iat: issued_at,
            exp: issued_at + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        })
    }

    /// Mint a signed token – convenience for local tooling and tests.
    pub fn mint_token(subject: &str, partitions: Vec<String>, secret: &str, ttl_secs: u64) -> Result<String> {
        let claims = build_claims(subject, partitions, ttl_secs)?;
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("insieme+jwt".into());
        encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| Error::new(&e.to_string()))
    }
}

//─────────────────────────────
//  Scope-based authorization
//─────────────────────────────

/// Grants access when every requested partition is in the identity scope.
///
/// A `"*"` entry in the scope matches any partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeAuthorizer;

#[async_trait]
impl PartitionAuthorizer for ScopeAuthorizer {
    async fn authorize(&self, identity: &Identity, partitions: &[String]) -> Result<bool> {
        if identity.partitions.iter().any(|p| p == "*") {
            return Ok(true);
        }
        Ok(partitions.iter().all(|p| identity.partitions.contains(p)))
    }
}

//─────────────────────────────
//  Test doubles
//─────────────────────────────

/// Verifier that accepts any token and derives the identity from it.
///
/// The raw token is used verbatim as the client id with a wildcard scope.
/// Only suitable for tests and local development.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureVerifier;

#[async_trait]
impl TokenVerifier for InsecureVerifier {
    async fn verify(&self, raw: &str) -> Result<Identity> {
        if raw.is_empty() {
            return Err(Error::new("empty token"));
        }
        Ok(Identity { client_id: raw.to_owned(), partitions: vec!["*".to_owned()] })
    }
}

/// Authorizer that grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PartitionAuthorizer for AllowAll {
    async fn authorize(&self, _identity: &Identity, _partitions: &[String]) -> Result<bool> {
        Ok(true)
    }
}

/// Glob-import helper.
pub mod prelude {
    pub use super::hs256::{build_claims, mint_token, JwtHs256Verifier};
    pub use super::{
        AllowAll, Claims, Identity, InsecureVerifier, PartitionAuthorizer, ScopeAuthorizer,
        TokenVerifier,
    };
}
