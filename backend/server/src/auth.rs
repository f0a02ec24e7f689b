use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    config::RateLimitConfig,
    database::DatabaseClient,
    error::AppError,
    models::User,
    provider::AuthProvider,
    utils::{mask_phone, normalize_phone, validate_code},
};

/// Sliding window limiter. Each key may be admitted `max_requests` times per
/// `window`; attempts are recorded on admission only.
pub struct RateLimiter {
    config: RateLimitConfig,
    attempts: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    /// On rejection returns how long until the oldest attempt leaves the window.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let window = self.config.window;
        let mut attempts = self.attempts.lock();

        attempts.retain(|_, times| {
            while times
                .front()
                .is_some_and(|&t| now.saturating_duration_since(t) >= window)
            {
                times.pop_front();
            }
            !times.is_empty()
        });

        let times = attempts.entry(key.to_string()).or_default();

        if times.len() >= self.config.max_requests {
            let retry_after = times
                .front()
                .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(window);

            return Err(retry_after.max(Duration::from_secs(1)));
        }

        times.push_back(now);

        Ok(())
    }

    pub fn tracked_keys(&self) -> usize {
        self.attempts.lock().len()
    }
}

fn rate_limited(retry_after: Duration) -> AppError {
    // Round up so clients never retry a moment too early.
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);

    AppError::RateLimited {
        retry_after_secs: secs.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct Verified {
    pub user: User,
    pub is_new_user: bool,
}

pub struct AuthService {
    database: Arc<dyn DatabaseClient>,
    provider: Arc<dyn AuthProvider>,
    send_limiter: RateLimiter,
    verify_limiter: RateLimiter,
}

impl AuthService {
    pub fn new(
        database: Arc<dyn DatabaseClient>,
        provider: Arc<dyn AuthProvider>,
        send_limit: RateLimitConfig,
        verify_limit: RateLimitConfig,
    ) -> Self {
        Self {
            database,
            provider,
            send_limiter: RateLimiter::new(send_limit),
            verify_limiter: RateLimiter::new(verify_limit),
        }
    }

    /// Returns the normalized phone number the code was sent to.
    pub async fn send_code(&self, raw_phone: &str) -> Result<String, AppError> {
        let phone_number = normalize_phone(raw_phone)?;

        if let Err(retry_after) = self.send_limiter.check(&phone_number) {
            warn!("Send code rate limited for {}", mask_phone(&phone_number));
            return Err(rate_limited(retry_after));
        }

        self.provider.send_code(&phone_number).await?;

        info!("Verification code sent to {}", mask_phone(&phone_number));

        Ok(phone_number)
    }

    pub async fn verify_code(&self, raw_phone: &str, raw_code: &str) -> Result<Verified, AppError> {
        let phone_number = normalize_phone(raw_phone)?;
        let code = validate_code(raw_code)?;

        if let Err(retry_after) = self.verify_limiter.check(&phone_number) {
            warn!("Verify code rate limited for {}", mask_phone(&phone_number));
            return Err(rate_limited(retry_after));
        }

        if !self.provider.check_code(&phone_number, &code).await? {
            info!("Verification rejected for {}", mask_phone(&phone_number));
            return Err(AppError::VerificationFailed);
        }

        let now = Utc::now();
        let (user, is_new_user) = match self.database.find_user_by_phone(&phone_number).await? {
            Some(user) => (user, false),
            None => (self.database.create_user(&phone_number, now).await?, true),
        };

        let user = self.database.record_login(user.id, now).await?;

        info!(
            "Verified {} (user {}, new: {is_new_user})",
            mask_phone(&phone_number),
            user.id
        );

        Ok(Verified { user, is_new_user })
    }
}
