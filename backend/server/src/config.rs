use std::{
    env,
    fmt::Display,
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_TWILIO_BASE_URL: &str = "https://verify.twilio.com";

const MIN_SESSION_SECRET_BYTES: usize = 32;
const MAX_SESSION_TTL_DAYS: i64 = 365;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("Invalid {key} value: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Twilio,
    Console,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twilio" => Ok(Self::Twilio),
            "console" => Ok(Self::Console),
            other => Err(format!("unknown auth provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

#[derive(Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub verify_service_sid: String,
    pub auth_token: String,
    pub base_url: String,
}

pub struct Config {
    pub port: u16,
    pub storage: StorageBackend,
    pub redis_url: String,
    pub auth_provider: ProviderKind,
    pub twilio: Option<TwilioConfig>,
    pub session_secret: String,
    pub session_ttl: chrono::Duration,
    pub cookie_secure: bool,
    pub cors_origin: Option<String>,
    pub send_code_limit: RateLimitConfig,
    pub verify_code_limit: RateLimitConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Secrets are read from
    /// `SECRETS_DIR` first and fall back to the lookup itself.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secrets_dir: PathBuf = lookup("SECRETS_DIR")
            .unwrap_or_else(|| "/run/secrets".to_string())
            .into();

        let auth_provider: ProviderKind = try_load(&lookup, "AUTH_PROVIDER", "twilio")?;

        let twilio = match auth_provider {
            ProviderKind::Twilio => Some(TwilioConfig {
                account_sid: required(&lookup, "TWILIO_ACCOUNT_SID")?,
                verify_service_sid: required(&lookup, "TWILIO_VERIFY_SERVICE_SID")?,
                auth_token: read_secret(&lookup, &secrets_dir, "TWILIO_AUTH_TOKEN")?,
                base_url: try_load(&lookup, "TWILIO_BASE_URL", DEFAULT_TWILIO_BASE_URL)?,
            }),
            ProviderKind::Console => {
                warn!("Console auth provider enabled, codes will be written to the log");
                None
            }
        };

        let session_secret = read_secret(&lookup, &secrets_dir, "SESSION_SECRET")?;
        if session_secret.len() < MIN_SESSION_SECRET_BYTES {
            return Err(ConfigError::Invalid {
                key: "SESSION_SECRET".to_string(),
                reason: format!("must be at least {MIN_SESSION_SECRET_BYTES} bytes"),
            });
        }

        let session_ttl_days: i64 = try_load(&lookup, "SESSION_TTL_DAYS", "30")?;
        if !(1..=MAX_SESSION_TTL_DAYS).contains(&session_ttl_days) {
            return Err(ConfigError::Invalid {
                key: "SESSION_TTL_DAYS".to_string(),
                reason: format!("must be between 1 and {MAX_SESSION_TTL_DAYS}"),
            });
        }

        Ok(Self {
            port: try_load(&lookup, "RUST_PORT", "8080")?,
            storage: try_load(&lookup, "STORAGE_BACKEND", "redis")?,
            redis_url: try_load(&lookup, "REDIS_URL", "redis://127.0.0.1:6379")?,
            auth_provider,
            twilio,
            session_secret,
            session_ttl: chrono::Duration::days(session_ttl_days),
            cookie_secure: try_load(&lookup, "COOKIE_SECURE", "true")?,
            cors_origin: lookup("CORS_ORIGIN").filter(|origin| !origin.trim().is_empty()),
            send_code_limit: load_limit(
                &lookup,
                ("SEND_CODE_MAX_REQUESTS", "3"),
                ("SEND_CODE_WINDOW_SECS", "600"),
            )?,
            verify_code_limit: load_limit(
                &lookup,
                ("VERIFY_CODE_MAX_ATTEMPTS", "5"),
                ("VERIFY_CODE_WINDOW_SECS", "600"),
            )?,
        })
    }
}

fn load_limit<F>(
    lookup: &F,
    (max_key, max_default): (&str, &str),
    (window_key, window_default): (&str, &str),
) -> Result<RateLimitConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let max_requests: usize = try_load(lookup, max_key, max_default)?;
    let window_secs: u64 = try_load(lookup, window_key, window_default)?;

    if max_requests == 0 || window_secs == 0 {
        return Err(ConfigError::Invalid {
            key: format!("{max_key}/{window_key}"),
            reason: "rate limits must be positive".to_string(),
        });
    }

    Ok(RateLimitConfig {
        max_requests,
        window: Duration::from_secs(window_secs),
    })
}

fn try_load<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .trim()
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn read_secret<F>(lookup: &F, secrets_dir: &Path, secret_name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = secrets_dir.join(secret_name);

    match read_to_string(&path) {
        Ok(secret) => Ok(secret.trim().to_string()),
        Err(e) => {
            warn!("Failed to read {secret_name} from file: {e}, falling back to environment");
            required(lookup, secret_name)
        }
    }
}
