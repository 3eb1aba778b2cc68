use axum::http::{HeaderMap, header};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::Identity;

/// Name of the cookie the frontend stores the session token in.
pub const SESSION_COOKIE: &str = "sb-access-token";

/// Claims
///
/// The payload of a session token issued by the auth provider and signed with the
/// storage access key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the caller's user id. Absent on anonymous tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Uuid>,
    /// `anon` or `authenticated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Expiration Time (exp): tokens past this instant are ignored.
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
}

/// TokenVerifier
///
/// Turns request credentials into an `Identity`. Resolution never fails: a request
/// whose credentials are missing or unusable simply acts as `Identity::Anonymous`,
/// which the policies treat as the least privileged role.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // Provider tokens carry `aud: authenticated`; the role claim is what we check.
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// resolve
    ///
    /// Looks for a token in `Authorization: Bearer <token>` first, then in the
    /// session cookie.
    pub fn resolve(&self, headers: &HeaderMap) -> Identity {
        let Some(token) = bearer_token(headers).or_else(|| cookie_token(headers)) else {
            return Identity::Anonymous;
        };

        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => identity_from(data.claims),
            Err(err) => {
                match err.kind() {
                    ErrorKind::ExpiredSignature => {
                        tracing::debug!("expired session token, continuing as anonymous")
                    }
                    _ => tracing::debug!(error = %err, "unusable session token, continuing as anonymous"),
                }
                Identity::Anonymous
            }
        }
    }
}

fn identity_from(claims: Claims) -> Identity {
    match (claims.role.as_deref(), claims.sub) {
        (None | Some("authenticated"), Some(subject_id)) => Identity::Authenticated { subject_id },
        (Some("anon"), _) | (_, None) => Identity::Anonymous,
        (Some(other), Some(_)) => {
            tracing::debug!(role = other, "token role is not served here, continuing as anonymous");
            Identity::Anonymous
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token)
        .filter(|token| !token.is_empty())
}
