/*!
Wires the store and the managers together from a [`ServiceConfig`]
*/

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uptime_store::{FileStore, RecordStore};

use crate::core::{
    accounts::AccountManager,
    checks::CheckManager,
    clock::{Clock, SystemClock},
    config::ServiceConfig,
    credentials::Credentials,
    dispatch::Router,
    error::{ServiceError, ServiceResult},
    locks::KeyLocks,
    maintenance::Maintenance,
    sessions::SessionManager,
};

pub struct UptimeService {
    config: ServiceConfig,
    store: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    accounts: Arc<AccountManager>,
    checks: Arc<CheckManager>,
}

impl UptimeService {
    pub async fn new(config: ServiceConfig) -> ServiceResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build the service around an explicit time source
    pub async fn with_clock(config: ServiceConfig, clock: Arc<dyn Clock>) -> ServiceResult<Self> {
        info!("Initializing uptime monitor in {} mode...", config.environment);

        let store: Arc<dyn RecordStore> = Arc::new(
            FileStore::open(config.store.data_dir.clone())
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?,
        );
        let credentials = Arc::new(Credentials::new(&config.credentials));
        let locks = Arc::new(KeyLocks::new());

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&credentials),
            clock,
        ));
        let checks = Arc::new(CheckManager::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&locks),
            config.limits.max_checks,
        ));
        let accounts = Arc::new(AccountManager::new(
            Arc::clone(&store),
            credentials,
            Arc::clone(&sessions),
            Arc::clone(&checks),
            locks,
        ));

        info!("📁 Data directory: {:?}", config.store.data_dir);
        info!("🔢 Max checks per user: {}", config.limits.max_checks);

        Ok(Self {
            config,
            store,
            sessions,
            accounts,
            checks,
        })
    }

    pub async fn from_config_file<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        let config = ServiceConfig::from_file(path).await?;
        Self::new(config).await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        Router::new(
            Arc::clone(&self.accounts),
            Arc::clone(&self.sessions),
            Arc::clone(&self.checks),
        )
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            Arc::clone(&self.checks),
            Duration::from_secs(self.config.maintenance.interval_secs.max(1)),
        )
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn accounts(&self) -> Arc<AccountManager> {
        Arc::clone(&self.accounts)
    }

    pub fn checks(&self) -> Arc<CheckManager> {
        Arc::clone(&self.checks)
    }
}
