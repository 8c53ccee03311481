use anyhow::Result;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use travelcore::users::{is_valid_email, normalize_email, NewUser};

/// Lifetime of issued tokens.
pub const TOKEN_TTL: Duration = Duration::hours(24);

/// Tokens with less than this left are reissued by the refresh endpoint.
pub const REFRESH_WINDOW: Duration = Duration::hours(1);

/// Account problems reported back to the person signing in or up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlert {
    #[error("There was an issue with either email or password.")]
    EmailOrPasswordError,
    #[error("The passwords provided don't match.")]
    PasswordMismatch,
    #[error("There is an issue with the email field input.")]
    EmailFieldIssue,
    #[error("The email provided already exists.")]
    EmailAlreadyExists,
    #[error("There was a general error during registration.")]
    RegistrationError,
}

/// Registration form: profile fields plus the password twice.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub user: NewUser,
    pub password: String,
    pub confirm_password: String,
}

impl RegisterRequest {
    /// Form-level checks that need no store access.
    pub fn validate(&self) -> std::result::Result<(), AuthAlert> {
        if !is_valid_email(&normalize_email(&self.user.email)) {
            return Err(AuthAlert::EmailFieldIssue);
        }
        if self.password != self.confirm_password {
            return Err(AuthAlert::PasswordMismatch);
        }
        if self.password.is_empty()
            || self.user.first_name.trim().is_empty()
            || self.user.last_name.trim().is_empty()
        {
            return Err(AuthAlert::RegistrationError);
        }
        Ok(())
    }
}

/// Hash a password using argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued JWTs. The subject is the account email.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn issue_jwt(secret: &[u8], email: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: email.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Determine if a token should be refreshed given a threshold duration.
pub fn needs_refresh(claims: &Claims, within: Duration) -> bool {
    match OffsetDateTime::from_unix_timestamp(claims.exp as i64) {
        Ok(expire) => expire - OffsetDateTime::now_utc() < within,
        Err(_) => true,
    }
}

/// Read the signing secret from `path`, creating a random one on first run.
pub async fn load_or_create_secret(path: &Path) -> Result<Vec<u8>> {
    if let Ok(encoded) = tokio::fs::read_to_string(path).await {
        if let Ok(secret) = STANDARD.decode(encoded.trim()) {
            if !secret.is_empty() {
                return Ok(secret);
            }
        }
        tracing::warn!(path = %path.display(), "unreadable jwt secret, generating a new one");
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, STANDARD.encode(&secret)).await?;
    Ok(secret)
}

/// Simple in-memory login rate limiter.
#[derive(Clone)]
pub struct LoginRateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max: usize,
    window: StdDuration,
}

impl LoginRateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Returns true if the attempt is allowed, false if rate limited.
    pub async fn check(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}
