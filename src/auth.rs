//! Password hashing and bearer-token auth.
//!
//! Passwords are stored as bcrypt hashes. Sessions are stateless signed
//! tokens carrying the user id and username with a 24 hour expiry. The
//! [`AuthUser`] extractor rejects any request without a valid bearer token.

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::Json;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::storage::now_secs;

const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug)]
pub enum AuthError {
    Hashing(bcrypt::BcryptError),
    Token(jsonwebtoken::errors::Error),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Hashing(e) => write!(f, "password hashing failed: {e}"),
            AuthError::Token(e) => write!(f, "token error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<bcrypt::BcryptError> for AuthError {
    fn from(e: bcrypt::BcryptError) -> Self {
        AuthError::Hashing(e)
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        AuthError::Token(e)
    }
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    Ok(bcrypt::verify(password, hash)?)
}

/// Token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub exp: u64,
}

/// Signing and verification keys derived from one secret.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, user_id: &str, username: &str) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            exp: now_secs() + TOKEN_TTL_SECS,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthKeys: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = AuthKeys::from_ref(state);
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let claims = token.and_then(|token| keys.verify(token).ok());
        match claims {
            Some(claims) => Ok(AuthUser {
                user_id: claims.user_id,
                username: claims.username,
            }),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "message": "authentication required" })),
            )),
        }
    }
}
