//! Backend for SMPL, a savings dashboard for recurring subscriptions.
//!
//!
//!
//! # Flow
//!
//! - User enters a phone number, we ask Twilio Verify to text a 6-digit code
//! - Code requests are rate limited per phone number before Twilio is ever called
//! - User submits the code, Twilio approves or rejects it
//! - On approval we find or create the user and hand back a signed session cookie
//! - User walks the categories (streaming, insurance, internet, phone carriers)
//!   and marks the services they pay for
//! - Progress is recomputed on every request from the selections, nothing cached
//!
//!
//!
//! # Layout
//!
//! - [`routes`]: JSON handlers, thin marshaling only
//! - [`auth`], [`selection`], [`progress`]: the logic behind the handlers
//! - [`database`], [`memory`]: storage behind [`database::DatabaseClient`]
//! - [`provider`]: SMS verification behind [`provider::AuthProvider`]
//! - [`session`]: signed session cookies and the signed-in user extractor
//!
//!
//!
//! # Running locally
//!
//! No redis and no Twilio account needed, codes show up in the log.
//! ```sh
//! STORAGE_BACKEND=memory AUTH_PROVIDER=console COOKIE_SECURE=false \
//! SESSION_SECRET=$(openssl rand -hex 32) RUST_LOG=info cargo run -p smpl
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Router,
    http::{
        HeaderValue, Method,
        header::{CONTENT_TYPE, COOKIE},
    },
    routing::{delete, get, post, put},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub mod auth;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod models;
pub mod progress;
pub mod provider;
pub mod routes;
pub mod selection;
pub mod session;
pub mod state;
pub mod utils;

use config::Config;
use routes::{
    categories_handler, category_handler, deselect_service_handler, health_handler,
    logout_handler, progress_handler, select_services_handler, send_code_handler,
    services_handler, session_handler, set_category_services_handler, user_services_handler,
    verify_code_handler,
};
use state::State;

pub async fn start_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load().context("Environment misconfigured")?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");

    let app = build_router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");

    Ok(())
}

pub fn build_router(state: Arc<State>) -> Router {
    let api = Router::new()
        .route("/auth/send-code", post(send_code_handler))
        .route("/auth/verify-code", post(verify_code_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/session", get(session_handler))
        .route("/categories", get(categories_handler))
        .route("/categories/:category_id", get(category_handler))
        .route("/services", get(services_handler))
        .route(
            "/user/services",
            get(user_services_handler).post(select_services_handler),
        )
        .route("/user/services/:service_id", delete(deselect_service_handler))
        .route(
            "/user/categories/:category_id/services",
            put(set_category_services_handler),
        )
        .route("/user/progress", get(progress_handler));

    let router = Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http());

    match cors_layer(state.config.cors_origin.as_deref()) {
        Some(cors) => router.layer(cors).with_state(state),
        None => router.with_state(state),
    }
}

fn cors_layer(origin: Option<&str>) -> Option<CorsLayer> {
    let origin = origin?;

    let origin = match HeaderValue::from_str(origin) {
        Ok(origin) => origin,
        Err(e) => {
            warn!("Ignoring invalid CORS_ORIGIN: {e}");
            return None;
        }
    };

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([CONTENT_TYPE, COOKIE])
            .allow_credentials(true)
            .max_age(Duration::from_secs(60 * 60)),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
