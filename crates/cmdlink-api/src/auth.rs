//! Shared-secret bearer authentication for the trigger endpoint.
//!
//! Enforced only when a secret is configured. Tokens are compared by their
//! SHA-256 digests.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::ErrorResponse;

#[derive(Clone, Default)]
pub struct AuthState {
    secret_digest: Option<[u8; 32]>,
}

impl AuthState {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_digest: secret.filter(|s| !s.is_empty()).map(digest),
        }
    }

    /// Authentication disabled.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.secret_digest.is_some()
    }

    pub fn validate(&self, token: &str) -> bool {
        match &self.secret_digest {
            Some(expected) => {
                let provided = digest(token);
                provided
                    .iter()
                    .zip(expected.iter())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
            }
            None => true,
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject requests without a valid `Authorization: Bearer <secret>` header.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    if !auth.is_enabled() {
        return Ok(next.run(req).await);
    }

    let token = bearer_token(&headers).ok_or_else(|| {
        ErrorResponse::unauthorized("Missing credential. Provide Authorization: Bearer <secret>")
    })?;

    if !auth.validate(token) {
        warn!(path = %req.uri().path(), "Rejected request with invalid credential");
        return Err(ErrorResponse::unauthorized("Invalid credential"));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_accepts_anything() {
        let auth = AuthState::open();
        assert!(!auth.is_enabled());
        assert!(auth.validate("whatever"));
        assert!(!AuthState::new(Some("")).is_enabled());
    }

    #[test]
    fn test_secret_validation() {
        let auth = AuthState::new(Some("s3cret"));
        assert!(auth.is_enabled());
        assert!(auth.validate("s3cret"));
        assert!(!auth.validate("s3cre"));
        assert!(!auth.validate(""));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
