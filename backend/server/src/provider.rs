//! # Verification providers
//!
//! SMS one-time codes are never generated or checked by us in production;
//! Twilio Verify owns the code, its expiry and its delivery. We only ask it to
//! send a code to a number and later whether a submitted code is approved.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{config::TwilioConfig, utils::mask_phone};

const CONSOLE_CODE_TTL: Duration = Duration::from_secs(10 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const TWILIO_INVALID_PARAMETER: u32 = 60200;
const TWILIO_MAX_SEND_ATTEMPTS: u32 = 60203;
const TWILIO_INVALID_TO_NUMBER: u32 = 21211;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider rate limit reached")]
    RateLimited,

    #[error("provider rejected the phone number")]
    InvalidPhoneNumber,

    #[error("provider returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn send_code(&self, phone_number: &str) -> Result<(), ProviderError>;

    /// `true` only when the code is approved for this phone number.
    async fn check_code(&self, phone_number: &str, code: &str) -> Result<bool, ProviderError>;
}

pub struct TwilioVerify {
    client: Client,
    config: TwilioConfig,
}

#[derive(Deserialize)]
struct VerificationResponse {
    status: String,
}

#[derive(Deserialize)]
struct TwilioErrorBody {
    code: Option<u32>,
    message: Option<String>,
}

impl TwilioVerify {
    pub fn new(config: TwilioConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, resource: &str) -> String {
        format!(
            "{}/v2/Services/{}/{resource}",
            self.config.base_url.trim_end_matches('/'),
            self.config.verify_service_sid
        )
    }

    async fn post(
        &self,
        resource: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(resource))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(form)
            .send()
            .await?;

        Ok(response)
    }
}

async fn into_error(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body: Option<TwilioErrorBody> = response.json().await.ok();

    let code = body.as_ref().and_then(|b| b.code);
    let message = body
        .and_then(|b| b.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    match (status, code) {
        (StatusCode::TOO_MANY_REQUESTS, _) | (_, Some(TWILIO_MAX_SEND_ATTEMPTS)) => {
            ProviderError::RateLimited
        }
        (_, Some(TWILIO_INVALID_PARAMETER | TWILIO_INVALID_TO_NUMBER)) => {
            ProviderError::InvalidPhoneNumber
        }
        _ => ProviderError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl AuthProvider for TwilioVerify {
    async fn send_code(&self, phone_number: &str) -> Result<(), ProviderError> {
        let response = self
            .post("Verifications", &[("To", phone_number), ("Channel", "sms")])
            .await?;

        if !response.status().is_success() {
            let err = into_error(response).await;
            warn!("Twilio send to {} failed: {err}", mask_phone(phone_number));
            return Err(err);
        }

        let verification: VerificationResponse = response.json().await?;
        info!(
            "Twilio verification for {} is {}",
            mask_phone(phone_number),
            verification.status
        );

        Ok(())
    }

    async fn check_code(&self, phone_number: &str, code: &str) -> Result<bool, ProviderError> {
        let response = self
            .post("VerificationCheck", &[("To", phone_number), ("Code", code)])
            .await?;

        // No pending verification: expired, already approved or never sent.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        if !response.status().is_success() {
            let err = into_error(response).await;
            warn!("Twilio check for {} failed: {err}", mask_phone(phone_number));
            return Err(err);
        }

        let verification: VerificationResponse = response.json().await?;

        Ok(verification.status == "approved")
    }
}

struct PendingCode {
    code: String,
    expires_at: Instant,
}

/// Development provider: logs codes instead of texting them.
#[derive(Default)]
pub struct ConsoleProvider {
    pending: Mutex<HashMap<String, PendingCode>>,
}

impl ConsoleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outstanding code for a phone number, if any.
    pub fn pending_code(&self, phone_number: &str) -> Option<String> {
        self.pending
            .lock()
            .get(phone_number)
            .filter(|pending| pending.expires_at > Instant::now())
            .map(|pending| pending.code.clone())
    }
}

#[async_trait]
impl AuthProvider for ConsoleProvider {
    async fn send_code(&self, phone_number: &str) -> Result<(), ProviderError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));

        info!("Verification code for {}: {code}", mask_phone(phone_number));

        self.pending.lock().insert(
            phone_number.to_string(),
            PendingCode {
                code,
                expires_at: Instant::now() + CONSOLE_CODE_TTL,
            },
        );

        Ok(())
    }

    async fn check_code(&self, phone_number: &str, code: &str) -> Result<bool, ProviderError> {
        let mut pending = self.pending.lock();
        let now = Instant::now();

        pending.retain(|_, entry| entry.expires_at > now);

        let approved = pending
            .get(phone_number)
            .is_some_and(|entry| entry.code == code);

        if approved {
            pending.remove(phone_number);
        }

        Ok(approved)
    }
}
