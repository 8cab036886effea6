/*!
Account lifecycle: registration, profile reads and edits, and deletion with
its cascade over owned checks
*/

use std::sync::Arc;

use tracing::{error, info, warn};
use uptime_store::{RecordStore, RecordStoreExt};

use crate::core::{
    checks::CheckManager,
    credentials::Credentials,
    error::{ServiceError, ServiceResult},
    locks::KeyLocks,
    models::{Account, AccountChanges, AccountView, PHONE_LEN, Registration, USERS},
    sessions::SessionManager,
};

pub struct AccountManager {
    store: Arc<dyn RecordStore>,
    credentials: Arc<Credentials>,
    sessions: Arc<SessionManager>,
    checks: Arc<CheckManager>,
    locks: Arc<KeyLocks>,
}

impl AccountManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        credentials: Arc<Credentials>,
        sessions: Arc<SessionManager>,
        checks: Arc<CheckManager>,
        locks: Arc<KeyLocks>,
    ) -> Self {
        Self {
            store,
            credentials,
            sessions,
            checks,
            locks,
        }
    }

    pub async fn register(&self, registration: Registration) -> ServiceResult<()> {
        let first_name = non_blank(registration.first_name);
        let last_name = non_blank(registration.last_name);
        let phone = non_blank(registration.phone).filter(|p| p.chars().count() == PHONE_LEN);
        let password = non_blank(registration.password);
        let tos_agreement = registration.tos_agreement == Some(true);

        let (Some(first_name), Some(last_name), Some(phone), Some(password), true) =
            (first_name, last_name, phone, password, tos_agreement)
        else {
            return Err(ServiceError::missing_fields());
        };

        let hashed_password = self
            .credentials
            .hash(&password)
            .ok_or_else(|| ServiceError::Internal("could not hash the password".to_string()))?;

        let account = Account {
            first_name,
            last_name,
            phone,
            hashed_password,
            tos_agreement: true,
            checks: Vec::new(),
        };

        let _guard = self.locks.acquire(&account.phone).await;

        // Checks of a previous account with this phone must not be inherited
        let vacant = matches!(
            self.store.read(USERS, &account.phone).await,
            Err(e) if e.is_not_found()
        );
        if vacant {
            self.checks.clear_leftovers_locked(&account.phone).await?;
        }

        match self.store.create_as(USERS, &account.phone, &account).await {
            Ok(()) => {
                info!("Registered user {}", account.phone);
                Ok(())
            }
            Err(e) if e.is_already_exists() => Err(ServiceError::Conflict(
                "A user with that phone number already exists".to_string(),
            )),
            Err(e) => {
                error!("Could not create user {}: {}", account.phone, e);
                Err(e.into())
            }
        }
    }

    /// Read an account through a token issued to it
    pub async fn get(&self, phone: &str, token: &str) -> ServiceResult<AccountView> {
        let phone = valid_phone(phone)?;
        if !self.sessions.verify(token, phone).await {
            return Err(ServiceError::Unauthorized);
        }

        let account: Account = self.store.read_as(USERS, phone).await?;
        Ok(account.into())
    }

    pub async fn update(
        &self,
        phone: &str,
        token: &str,
        changes: AccountChanges,
    ) -> ServiceResult<AccountView> {
        let phone = valid_phone(phone)?;
        let changes = AccountChanges {
            first_name: non_blank(changes.first_name),
            last_name: non_blank(changes.last_name),
            password: non_blank(changes.password),
        };
        if changes.is_empty() {
            return Err(ServiceError::nothing_to_update());
        }
        if !self.sessions.verify(token, phone).await {
            return Err(ServiceError::Unauthorized);
        }

        let _guard = self.locks.acquire(phone).await;
        let mut account: Account = self.store.read_as(USERS, phone).await?;

        if let Some(first_name) = changes.first_name {
            account.first_name = first_name;
        }
        if let Some(last_name) = changes.last_name {
            account.last_name = last_name;
        }
        if let Some(password) = changes.password {
            account.hashed_password = self
                .credentials
                .hash(&password)
                .ok_or_else(|| ServiceError::Internal("could not hash the password".to_string()))?;
        }

        self.store.update_as(USERS, phone, &account).await?;
        info!("Updated user {}", phone);
        Ok(account.into())
    }

    /// Delete an account after deleting every check it owns.
    ///
    /// The account is removed even if some checks could not be; that case is
    /// reported as `IncompleteCleanup` and maintenance finishes the job.
    pub async fn delete(&self, phone: &str, token: &str) -> ServiceResult<()> {
        let phone = valid_phone(phone)?;
        if !self.sessions.verify(token, phone).await {
            return Err(ServiceError::Unauthorized);
        }

        let _guard = self.locks.acquire(phone).await;
        let account: Account = self.store.read_as(USERS, phone).await?;

        let failed = self.checks.purge_locked(phone, &account.checks).await;

        self.store.delete(USERS, phone).await?;
        info!("Deleted user {}", phone);

        if let Err(e) = self.sessions.revoke_all_for(phone).await {
            warn!("Could not revoke sessions of deleted user {}: {}", phone, e);
        }

        if failed.is_empty() {
            Ok(())
        } else {
            warn!(
                "User {} deleted but {} of its checks remain: {:?}",
                phone,
                failed.len(),
                failed
            );
            Err(ServiceError::IncompleteCleanup {
                failed: failed.len(),
            })
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn valid_phone(phone: &str) -> ServiceResult<&str> {
    let phone = phone.trim();
    if phone.chars().count() == PHONE_LEN {
        Ok(phone)
    } else {
        Err(ServiceError::missing_fields())
    }
}
