use axum::{
    Json,
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::{config::ConfigError, database::DatabaseError, provider::ProviderError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Invalid phone number")]
    InvalidPhoneNumber,

    #[error("Verification code must be 6 digits")]
    InvalidCode,

    #[error("Incorrect or expired verification code")]
    VerificationFailed,

    #[error("Unknown services: {}", .0.join(", "))]
    UnknownServices(Vec<String>),

    #[error("Not signed in")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Verification provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedPayload
            | AppError::InvalidPhoneNumber
            | AppError::InvalidCode
            | AppError::UnknownServices(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::VerificationFailed => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Provider(ProviderError::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Provider(ProviderError::InvalidPhoneNumber) => StatusCode::BAD_REQUEST,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Config(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!("{self}");
                "Internal server error".to_string()
            }
            StatusCode::BAD_GATEWAY => {
                warn!("{self}");
                "Verification provider unavailable".to_string()
            }
            _ => self.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();

        if let AppError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, retry_after_secs.into());
        }

        response
    }
}
