//! Bearer authentication for the admin API.
//!
//! Admin tokens are HS256 JWTs carrying `{sub, roles, exp}`; `sub` becomes
//! the caller's user and `roles` its credential roles. The control surface
//! uses a shared static token instead.

use std::time::Duration;

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use pitboss_contracts::{
    error::{PitbossError, PitbossResult},
    tenant::Caller,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `user` valid for `ttl`.
    pub fn issue_token(&self, user: &str, roles: &[&str], ttl: Duration) -> PitbossResult<String> {
        let exp = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let claims = Claims { sub: user.to_string(), roles: roles.iter().map(|r| r.to_string()).collect(), exp };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| PitbossError::internal(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> PitbossResult<Caller> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                JwtErrorKind::ExpiredSignature => "token expired".to_string(),
                _ => format!("invalid token: {e}"),
            };
            PitbossError::Unauthenticated { reason }
        })?;
        if data.claims.sub.is_empty() {
            return Err(PitbossError::Unauthenticated { reason: "token has no subject".to_string() });
        }
        Ok(Caller { user: data.claims.sub, roles: data.claims.roles })
    }

    /// Authenticate the request's bearer credential.
    pub fn caller_from_headers(&self, headers: &HeaderMap) -> PitbossResult<Caller> {
        let token = bearer_token(headers)
            .ok_or_else(|| PitbossError::Unauthenticated { reason: "missing bearer token".to_string() })?;
        self.verify(token)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn issued_tokens_verify_to_the_caller() {
        let auth = JwtAuth::new("s3cret");
        let token = auth.issue_token("alice", &["gm"], Duration::from_secs(60)).unwrap();
        let caller = auth.verify(&token).unwrap();
        assert_eq!(caller, Caller::new("alice", &["gm"]));
    }

    #[test]
    fn wrong_secret_is_unauthenticated() {
        let token = JwtAuth::new("s3cret").issue_token("alice", &[], Duration::from_secs(60)).unwrap();
        match JwtAuth::new("other").verify(&token) {
            Err(PitbossError::Unauthenticated { .. }) => {}
            other => panic!("expected unauthenticated, got {:?}", other),
        }
    }

    #[test]
    fn expired_token_is_unauthenticated() {
        let auth = JwtAuth::new("s3cret");
        let claims = Claims { sub: "alice".to_string(), roles: Vec::new(), exp: chrono::Utc::now().timestamp() - 10 };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"s3cret")).unwrap();
        match auth.verify(&token) {
            Err(PitbossError::Unauthenticated { reason }) => assert_eq!(reason, "token expired"),
            other => panic!("expected unauthenticated, got {:?}", other),
        }
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
