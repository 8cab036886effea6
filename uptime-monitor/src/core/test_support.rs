/*!
Shared fixtures for unit tests
*/

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tempfile::TempDir;
use uptime_store::{RecordStore, StoreError, StoreResult};

use crate::core::{
    accounts::AccountManager,
    checks::CheckManager,
    clock::{Clock, ManualClock},
    config::ServiceConfig,
    credentials::Credentials,
    dispatch::Router,
    locks::KeyLocks,
    models::{CHECKS, CheckFields, Registration},
    service::UptimeService,
    sessions::SessionManager,
};

pub(crate) struct Harness {
    _dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub service: UptimeService,
    store: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    accounts: Arc<AccountManager>,
    checks: Arc<CheckManager>,
}

impl Harness {
    pub async fn new(max_checks: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ServiceConfig::default();
        config.store.data_dir = dir.path().join("data");
        config.limits.max_checks = max_checks;

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("start");
        let clock = Arc::new(ManualClock::new(start));
        let service = UptimeService::with_clock(config, clock.clone())
            .await
            .expect("service");

        Self {
            _dir: dir,
            clock,
            store: service.store(),
            sessions: service.sessions(),
            accounts: service.accounts(),
            checks: service.checks(),
            service,
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn checks(&self) -> &CheckManager {
        &self.checks
    }

    pub fn router(&self) -> Router {
        self.service.router()
    }

    /// Path of a record file inside the harness data directory
    pub fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.service
            .config()
            .store
            .data_dir
            .join(collection)
            .join(format!("{key}.json"))
    }

    /// Account and check managers sharing this harness's clock and
    /// configuration, but reading and writing through `store`
    pub fn managers_over(
        &self,
        store: Arc<dyn RecordStore>,
    ) -> (Arc<AccountManager>, Arc<CheckManager>) {
        let config = self.service.config();
        let clock: Arc<dyn Clock> = self.clock.clone();
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
            store,
            credentials,
            sessions,
            Arc::clone(&checks),
            locks,
        ));
        (accounts, checks)
    }

    pub async fn register(&self, phone: &str, password: &str) {
        self.accounts
            .register(Registration {
                first_name: Some("Test".to_string()),
                last_name: Some("User".to_string()),
                phone: Some(phone.to_string()),
                password: Some(password.to_string()),
                tos_agreement: Some(true),
            })
            .await
            .expect("register");
    }

    pub async fn login(&self, phone: &str, password: &str) -> String {
        self.sessions.login(phone, password).await.expect("login").id
    }
}

pub(crate) fn valid_check() -> CheckFields {
    CheckFields {
        protocol: Some("https".to_string()),
        url: Some("example.com/health".to_string()),
        method: Some("get".to_string()),
        success_codes: Some(vec![200, 201, 200]),
        timeout_seconds: Some(3),
    }
}

/// Passes everything through, except that deleting one check always fails
pub(crate) struct StuckCheck {
    pub inner: Arc<dyn RecordStore>,
    pub id: String,
}

#[async_trait]
impl RecordStore for StuckCheck {
    async fn create(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()> {
        self.inner.create(collection, key, document).await
    }

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Value> {
        self.inner.read(collection, key).await
    }

    async fn update(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()> {
        self.inner.update(collection, key, document).await
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<()> {
        if collection == CHECKS && key == self.id {
            return Err(StoreError::Io {
                collection: collection.to_string(),
                key: key.to_string(),
                source: std::io::Error::other("device or resource busy"),
            });
        }
        self.inner.delete(collection, key).await
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.inner.list(collection).await
    }
}

/// A raw check record, as written before any account list refers to it
pub(crate) fn raw_check(id: &str, owner: &str, url: &str) -> Value {
    serde_json::json!({
        "id": id,
        "userPhone": owner,
        "protocol": "https",
        "url": url,
        "method": "get",
        "successCodes": [200],
        "timeoutSeconds": 3
    })
}
