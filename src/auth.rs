//! Admin tokens
//!
//! Tokens are HS256 JWTs signed with the server secret. Nothing is stored
//! server-side; a token is valid exactly when its signature and expiry check
//! out and it carries `type = "admin"`.

use crate::{Error, Result};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Value of the `type` claim on admin tokens
pub const ADMIN_TOKEN_TYPE: &str = "admin";

/// Claims the server sets itself; requests may not override them.
const RESERVED_CLAIMS: &[&str] = &["iat", "exp", "type", "server"];

/// Claims carried by an admin token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminClaims {
    pub iat: i64,
    pub exp: i64,
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub server: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Issues and verifies admin tokens for one server.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    server: String,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    pub fn new(secret: &str, server: impl Into<String>) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("token secret must not be empty".to_string()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            server: server.into(),
        })
    }

    /// Server identity written into the `server` claim.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Sign a new admin token valid for `ttl`.
    pub fn issue(&self, extra: &Map<String, Value>, ttl: Duration) -> Result<String> {
        if let Some(reserved) = extra.keys().find(|k| RESERVED_CLAIMS.contains(&k.as_str())) {
            return Err(Error::MalformedRequest(format!(
                "claim '{reserved}' is set by the server"
            )));
        }
        let ttl = i64::try_from(ttl.as_secs())
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                Error::MalformedRequest(format!("token lifetime of {ttl:?} is out of range"))
            })?;

        let now = chrono::Utc::now().timestamp();
        let mut extra = extra.clone();
        let sub = match extra.remove("sub") {
            Some(Value::String(sub)) => sub,
            Some(other) => {
                return Err(Error::MalformedRequest(format!(
                    "claim 'sub' must be a string, got {other}"
                )));
            }
            None => ADMIN_TOKEN_TYPE.to_string(),
        };

        let claims = AdminClaims {
            iat: now,
            exp: now.saturating_add(ttl),
            sub,
            token_type: ADMIN_TOKEN_TYPE.to_string(),
            server: self.server.clone(),
            extra,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))
    }

    /// Check signature, expiry and token type.
    pub fn verify(&self, token: &str) -> Result<AdminClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<AdminClaims>(token, &self.decoding, &validation)
            .map_err(|e| Error::Unauthenticated(format!("invalid token: {e}")))?;
        if data.claims.token_type != ADMIN_TOKEN_TYPE {
            return Err(Error::Unauthenticated(format!(
                "token type '{}' is not permitted",
                data.claims.token_type
            )));
        }
        Ok(data.claims)
    }
}
