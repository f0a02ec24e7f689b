//! # Sessions
//!
//! A verified phone number gets a signed session token in an `HttpOnly`
//! cookie. Tokens are `{user_id}.{expires_unix}.{signature}` where the
//! signature is HMAC-SHA256 over `{user_id}.{expires_unix}`, hex encoded.
//! Nothing about the session is stored server side.
use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, header::COOKIE, request::Parts},
};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::{config::ConfigError, error::AppError, models::User, state::State};

pub const SESSION_COOKIE: &str = "smpl_session";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claims {
    pub user_id: Uuid,
    pub expires_at: i64,
}

pub struct SessionSigner {
    key: HmacSha256,
    ttl: Duration,
    secure_cookie: bool,
}

impl SessionSigner {
    pub fn new(secret: &str, ttl: Duration, secure_cookie: bool) -> Result<Self, ConfigError> {
        let key =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| ConfigError::Invalid {
                key: "SESSION_SECRET".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            key,
            ttl,
            secure_cookie,
        })
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = self.key.clone();
        mac.update(payload.as_bytes());
        mac
    }

    pub fn issue(&self, user_id: Uuid, now: DateTime<Utc>) -> String {
        let expires_at = (now + self.ttl).timestamp();
        let payload = format!("{user_id}.{expires_at}");
        let signature = hex::encode(self.mac(&payload).finalize().into_bytes());

        format!("{payload}.{signature}")
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Option<Claims> {
        let (payload, signature) = token.rsplit_once('.')?;
        let (user_id, expires_at) = payload.split_once('.')?;

        let signature = hex::decode(signature).ok()?;
        self.mac(payload).verify_slice(&signature).ok()?;

        let claims = Claims {
            user_id: user_id.parse().ok()?,
            expires_at: expires_at.parse().ok()?,
        };

        (claims.expires_at > now.timestamp()).then_some(claims)
    }

    pub fn cookie(&self, token: &str) -> String {
        self.cookie_with_max_age(token, self.ttl.num_seconds())
    }

    pub fn clear_cookie(&self) -> String {
        self.cookie_with_max_age("", 0)
    }

    fn cookie_with_max_age(&self, value: &str, max_age: i64) -> String {
        let mut cookie =
            format!("{SESSION_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");

        if self.secure_cookie {
            cookie.push_str("; Secure");
        }

        cookie
    }
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// The signed-in user, resolved from the session cookie.
pub struct SessionUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<State>> for SessionUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<State>) -> Result<Self, AppError> {
        let token = session_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let claims = state
            .sessions
            .verify(token, Utc::now())
            .ok_or(AppError::Unauthorized)?;

        state
            .database
            .get_user(claims.user_id)
            .await?
            .map(SessionUser)
            .ok_or(AppError::Unauthorized)
    }
}
