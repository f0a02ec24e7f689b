use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::{
    auth::AuthService,
    catalog::{Catalog, seed_catalog},
    config::{Config, ProviderKind, StorageBackend},
    database::{DatabaseClient, RedisDatabase},
    memory::MemoryDatabase,
    progress::ProgressService,
    provider::{AuthProvider, ConsoleProvider, TwilioVerify},
    selection::ServiceSelectionService,
    session::SessionSigner,
};

pub struct State {
    pub config: Config,
    pub database: Arc<dyn DatabaseClient>,
    pub auth: AuthService,
    pub sessions: SessionSigner,
    pub selection: ServiceSelectionService,
    pub progress: ProgressService,
}

impl State {
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let database: Arc<dyn DatabaseClient> = match config.storage {
            StorageBackend::Redis => Arc::new(
                RedisDatabase::connect(&config.redis_url)
                    .await
                    .context("Failed to connect to redis")?,
            ),
            StorageBackend::Memory => {
                info!("Using in-memory storage, data is lost on restart");
                Arc::new(MemoryDatabase::new())
            }
        };

        let provider: Arc<dyn AuthProvider> = match (&config.auth_provider, &config.twilio) {
            (ProviderKind::Twilio, Some(twilio)) => Arc::new(TwilioVerify::new(twilio.clone())?),
            (ProviderKind::Twilio, None) => {
                anyhow::bail!("Twilio provider selected without credentials")
            }
            (ProviderKind::Console, _) => Arc::new(ConsoleProvider::new()),
        };

        let catalog = Catalog::bundled()?;
        seed_catalog(database.as_ref(), &catalog).await?;

        Self::with_parts(config, database, provider)
    }

    /// Assembles state around already constructed storage and provider.
    pub fn with_parts(
        config: Config,
        database: Arc<dyn DatabaseClient>,
        provider: Arc<dyn AuthProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let sessions = SessionSigner::new(
            &config.session_secret,
            config.session_ttl,
            config.cookie_secure,
        )?;

        let auth = AuthService::new(
            database.clone(),
            provider,
            config.send_code_limit,
            config.verify_code_limit,
        );

        Ok(Arc::new(Self {
            selection: ServiceSelectionService::new(database.clone()),
            progress: ProgressService::new(database.clone()),
            auth,
            sessions,
            database,
            config,
        }))
    }
}
