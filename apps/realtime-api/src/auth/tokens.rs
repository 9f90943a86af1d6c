//! Link tokens: HS256 JWTs signed with the process-wide hub secret.
//!
//! The REST layer issues these with the same secret; the hub only verifies
//! them on the WebSocket upgrade. REST tokens identify the user with a
//! `user_id` claim (usually numeric) and may carry no expiry at all.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::error::HandshakeError;

/// Header carrying the token for clients that can set headers.
pub const TOKEN_HEADER: &str = "jwt";

/// Claims the hub reads from a link token. Anything else is ignored.
#[derive(Debug, Deserialize)]
pub struct LinkClaims {
    /// User id as issued by the REST layer, a number or a string.
    #[serde(default)]
    pub user_id: Option<Value>,
    /// Standard subject, used when `user_id` is absent.
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl LinkClaims {
    /// The user this token was issued to, in its string form.
    pub fn subject(&self) -> Option<String> {
        match &self.user_id {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => None,
            None => self.sub.clone(),
        }
    }
}

/// Verify a link token and return its claims. `exp` is checked only when
/// the token carries one.
pub fn verify_link_token(secret: &str, token: &str) -> Result<LinkClaims, HandshakeError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<LinkClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|err| {
            tracing::debug!(?err, "link token rejected");
            HandshakeError::InvalidToken
        })
}

/// Verify a token and check that it belongs to `user_id`.
pub fn authenticate(secret: &str, token: &str, user_id: &str) -> Result<(), HandshakeError> {
    let claims = verify_link_token(secret, token)?;
    match claims.subject() {
        Some(subject) if subject == user_id => Ok(()),
        _ => Err(HandshakeError::IdentityMismatch),
    }
}
