/*!
Check lifecycle, per-account quota, and the reconciliation that keeps each
account's check list in line with the check records that name it as owner
*/

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uptime_store::{RecordStore, RecordStoreExt};

use crate::core::{
    credentials::Credentials,
    error::{ServiceError, ServiceResult},
    locks::KeyLocks,
    models::{
        Account, CHECK_ID_LEN, CHECKS, Check, CheckFields, HttpMethod, MAX_TIMEOUT_SECONDS,
        MIN_TIMEOUT_SECONDS, Protocol, USERS,
    },
    sessions::SessionManager,
};

pub struct CheckManager {
    store: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    locks: Arc<KeyLocks>,
    max_checks: usize,
}

/// Check records split by whether they could be parsed
#[derive(Debug, Default)]
struct Scan {
    checks: Vec<Check>,
    unreadable: Vec<String>,
}

/// Validated values of a [`CheckFields`]; `None` means "not supplied"
#[derive(Debug, Default)]
struct ValidFields {
    protocol: Option<Protocol>,
    url: Option<String>,
    method: Option<HttpMethod>,
    success_codes: Option<Vec<u16>>,
    timeout_seconds: Option<u8>,
}

impl CheckManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sessions: Arc<SessionManager>,
        locks: Arc<KeyLocks>,
        max_checks: usize,
    ) -> Self {
        Self {
            store,
            sessions,
            locks,
            max_checks,
        }
    }

    pub fn max_checks(&self) -> usize {
        self.max_checks
    }

    /// Create a check for the account the token belongs to
    pub async fn create(&self, token: &str, fields: CheckFields) -> ServiceResult<Check> {
        let ValidFields {
            protocol: Some(protocol),
            url: Some(url),
            method: Some(method),
            success_codes: Some(success_codes),
            timeout_seconds: Some(timeout_seconds),
        } = validate(fields)?
        else {
            return Err(invalid_check_input());
        };

        let phone = self.sessions.owner_of(token).await?;
        let _guard = self.locks.acquire(&phone).await;

        let mut account: Account = match self.store.read_as(USERS, &phone).await {
            Ok(account) => account,
            Err(e) if e.is_not_found() => return Err(ServiceError::Unauthorized),
            Err(e) => return Err(e.into()),
        };

        if account.checks.len() >= self.max_checks {
            return Err(ServiceError::QuotaExceeded {
                max: self.max_checks,
            });
        }

        let id = Credentials::random_identifier(CHECK_ID_LEN)
            .ok_or_else(|| ServiceError::Internal("could not generate a check id".to_string()))?;
        let check = Check {
            id,
            user_phone: phone.clone(),
            protocol,
            url,
            method,
            success_codes,
            timeout_seconds,
        };

        self.store.create_as(CHECKS, &check.id, &check).await?;

        account.checks.push(check.id.clone());
        if let Err(e) = self.store.update_as(USERS, &phone, &account).await {
            error!("Could not add check {} to user {}: {}", check.id, phone, e);
            if let Err(undo) = self.store.delete(CHECKS, &check.id).await {
                error!("Could not roll back check {}: {}", check.id, undo);
            }
            return Err(ServiceError::Internal(
                "could not update the user with the new check".to_string(),
            ));
        }

        info!("Created check {} for {}", check.id, phone);
        Ok(check)
    }

    pub async fn get(&self, id: &str, token: &str) -> ServiceResult<Check> {
        let id = valid_check_id(id)?;
        let check: Check = self.store.read_as(CHECKS, id).await?;
        self.authorize_owner(&check, token).await?;
        Ok(check)
    }

    pub async fn update(&self, id: &str, token: &str, fields: CheckFields) -> ServiceResult<Check> {
        let id = valid_check_id(id)?;
        if fields.is_empty() {
            return Err(ServiceError::nothing_to_update());
        }
        let changes = validate(fields)?;

        let check: Check = self.store.read_as(CHECKS, id).await?;
        self.authorize_owner(&check, token).await?;

        let _guard = self.locks.acquire(&check.user_phone).await;
        // Re-read under the lock so concurrent edits are not lost
        let mut check: Check = self.store.read_as(CHECKS, id).await?;

        if let Some(protocol) = changes.protocol {
            check.protocol = protocol;
        }
        if let Some(url) = changes.url {
            check.url = url;
        }
        if let Some(method) = changes.method {
            check.method = method;
        }
        if let Some(success_codes) = changes.success_codes {
            check.success_codes = success_codes;
        }
        if let Some(timeout_seconds) = changes.timeout_seconds {
            check.timeout_seconds = timeout_seconds;
        }

        self.store.update_as(CHECKS, id, &check).await?;
        debug!("Updated check {}", id);
        Ok(check)
    }

    /// Delete a check and drop it from its owner's list. An id that is
    /// already gone from the list counts as removed.
    pub async fn delete(&self, id: &str, token: &str) -> ServiceResult<()> {
        let id = valid_check_id(id)?;
        let check: Check = self.store.read_as(CHECKS, id).await?;
        self.authorize_owner(&check, token).await?;

        let phone = check.user_phone;
        let _guard = self.locks.acquire(&phone).await;

        match self.store.delete(CHECKS, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Check {} was already deleted", id),
            Err(e) => return Err(e.into()),
        }

        let mut account: Account = match self.store.read_as(USERS, &phone).await {
            Ok(account) => account,
            Err(e) if e.is_not_found() => {
                warn!("Owner {} of deleted check {} no longer exists", phone, id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let before = account.checks.len();
        account.checks.retain(|listed| listed != id);
        if account.checks.len() == before {
            debug!("Check {} was not listed on user {}", id, phone);
        } else {
            self.store.update_as(USERS, &phone, &account).await?;
        }

        info!("Deleted check {} of {}", id, phone);
        Ok(())
    }

    /// Rewrite the check list of `phone` from the check records that name it
    /// as owner. Returns whether anything had to change.
    pub async fn repair_check_list(&self, phone: &str) -> ServiceResult<bool> {
        let _guard = self.locks.acquire(phone).await;

        let mut account: Account = match self.store.read_as(USERS, phone).await {
            Ok(account) => account,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let owned: BTreeSet<String> = self.scan_owned(phone).await?.into_iter().collect();
        let mut repaired: Vec<String> = Vec::with_capacity(owned.len());
        for id in &account.checks {
            if owned.contains(id) && !repaired.contains(id) {
                repaired.push(id.clone());
            }
        }
        for id in &owned {
            if !repaired.contains(id) {
                repaired.push(id.clone());
            }
        }

        if repaired == account.checks {
            return Ok(false);
        }

        warn!(
            "Repairing check list of {}: {:?} -> {:?}",
            phone, account.checks, repaired
        );
        account.checks = repaired;
        self.store.update_as(USERS, phone, &account).await?;
        Ok(true)
    }

    /// Delete the checks of an owner that no longer has an account. Does
    /// nothing if the account exists. Returns how many checks were removed.
    pub async fn purge_orphaned(&self, phone: &str) -> ServiceResult<usize> {
        let _guard = self.locks.acquire(phone).await;

        match self.store.read(USERS, phone).await {
            Ok(_) => return Ok(0),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let owned = self.scan_owned(phone).await?;
        let failed = self.delete_all(&owned).await;
        if !failed.is_empty() {
            warn!("Could not purge {} orphaned checks of {}", failed.len(), phone);
        }
        Ok(owned.len() - failed.len())
    }

    /// Delete every check still naming `phone` as owner before the phone is
    /// given to a new account; the caller holds the account lock and has
    /// seen that no account exists. Fails unless all of them are gone.
    pub(crate) async fn clear_leftovers_locked(&self, phone: &str) -> ServiceResult<usize> {
        let owned = self.scan_owned(phone).await?;
        if owned.is_empty() {
            return Ok(0);
        }

        let failed = self.delete_all(&owned).await;
        if !failed.is_empty() {
            error!(
                "Could not remove {} checks left behind by a previous owner of {}",
                failed.len(),
                phone
            );
            return Err(ServiceError::Internal(format!(
                "could not remove {} leftover checks",
                failed.len()
            )));
        }

        warn!("Removed {} checks left behind by a previous owner of {}", owned.len(), phone);
        Ok(owned.len())
    }

    /// Delete every check owned by `phone`; the caller holds the account lock.
    /// `listed` is used only if the check collection cannot be scanned.
    /// Returns the ids that could not be deleted, including listed checks
    /// whose records are unreadable.
    pub(crate) async fn purge_locked(&self, phone: &str, listed: &[String]) -> Vec<String> {
        let (ids, unreadable): (Vec<String>, Vec<String>) = match self.scan().await {
            Ok(scan) => (
                scan.checks
                    .into_iter()
                    .filter(|check| check.user_phone == phone)
                    .map(|check| check.id)
                    .collect(),
                scan.unreadable
                    .into_iter()
                    .filter(|key| listed.contains(key))
                    .collect(),
            ),
            Err(e) => {
                warn!("Could not scan checks of {}, using its list: {}", phone, e);
                (listed.to_vec(), Vec::new())
            }
        };

        let mut failed = self.delete_all(&ids).await;
        if !unreadable.is_empty() {
            warn!("Leaving unreadable checks {:?} of {} in place", unreadable, phone);
            failed.extend(unreadable);
        }
        failed
    }

    /// Every readable check record
    pub async fn scan_all(&self) -> ServiceResult<Vec<Check>> {
        Ok(self.scan().await?.checks)
    }

    async fn scan(&self) -> ServiceResult<Scan> {
        let mut scan = Scan::default();
        for key in self.store.list(CHECKS).await? {
            match self.store.read_as::<Check>(CHECKS, &key).await {
                Ok(check) => scan.checks.push(check),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("Skipping unreadable check record: {}", e);
                    scan.unreadable.push(key);
                }
            }
        }
        Ok(scan)
    }

    async fn scan_owned(&self, phone: &str) -> ServiceResult<Vec<String>> {
        Ok(self
            .scan_all()
            .await?
            .into_iter()
            .filter(|check| check.user_phone == phone)
            .map(|check| check.id)
            .collect())
    }

    async fn delete_all(&self, ids: &[String]) -> Vec<String> {
        let deletions = ids.iter().map(|id| async move {
            match self.store.delete(CHECKS, id).await {
                Ok(()) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    error!("Could not delete check {}: {}", id, e);
                    Some(id.clone())
                }
            }
        });
        join_all(deletions).await.into_iter().flatten().collect()
    }

    async fn authorize_owner(&self, check: &Check, token: &str) -> ServiceResult<()> {
        if self.sessions.verify(token, &check.user_phone).await {
            Ok(())
        } else {
            Err(ServiceError::Forbidden)
        }
    }
}

fn invalid_check_input() -> ServiceError {
    ServiceError::InvalidInput("Missing required inputs, or inputs are invalid".to_string())
}

fn valid_check_id(id: &str) -> ServiceResult<&str> {
    let id = id.trim();
    if id.chars().count() == CHECK_ID_LEN {
        Ok(id)
    } else {
        Err(ServiceError::missing_fields())
    }
}

/// Validate whatever fields were supplied. Supplied-but-invalid is an error;
/// absent stays absent.
fn validate(fields: CheckFields) -> ServiceResult<ValidFields> {
    let protocol = fields
        .protocol
        .map(|p| p.trim().parse::<Protocol>())
        .transpose()?;
    let method = fields
        .method
        .map(|m| m.trim().parse::<HttpMethod>())
        .transpose()?;

    let url = match fields.url.map(|u| u.trim().to_string()) {
        Some(url) if url.is_empty() => return Err(invalid_check_input()),
        other => other,
    };

    let success_codes = match fields.success_codes {
        Some(codes) => {
            let mut valid: Vec<u16> = Vec::with_capacity(codes.len());
            for code in codes {
                let code = u16::try_from(code)
                    .ok()
                    .filter(|c| (100..=599).contains(c))
                    .ok_or_else(invalid_check_input)?;
                if !valid.contains(&code) {
                    valid.push(code);
                }
            }
            if valid.is_empty() {
                return Err(invalid_check_input());
            }
            Some(valid)
        }
        None => None,
    };

    let timeout_seconds = match fields.timeout_seconds {
        Some(timeout) => Some(
            u8::try_from(timeout)
                .ok()
                .filter(|t| (MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(t))
                .ok_or_else(invalid_check_input)?,
        ),
        None => None,
    };

    Ok(ValidFields {
        protocol,
        url,
        method,
        success_codes,
        timeout_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{Harness, valid_check};

    #[tokio::test]
    async fn create_persists_check_and_lists_it_on_the_account() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;

        let check = h.checks().create(&token, valid_check()).await.expect("create");

        assert_eq!(check.id.len(), CHECK_ID_LEN);
        assert_eq!(check.user_phone, "5551234567");
        assert_eq!(check.success_codes, vec![200, 201]);
        let stored: Check = h.store().read_as(CHECKS, &check.id).await.expect("read");
        assert_eq!(stored, check);
        let account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        assert_eq!(account.checks, vec![check.id]);
    }

    #[tokio::test]
    async fn create_rejects_invalid_fields() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;

        let cases = [
            CheckFields { protocol: Some("ftp".to_string()), ..valid_check() },
            CheckFields { protocol: None, ..valid_check() },
            CheckFields { url: Some("  ".to_string()), ..valid_check() },
            CheckFields { method: Some("patch".to_string()), ..valid_check() },
            CheckFields { success_codes: Some(vec![]), ..valid_check() },
            CheckFields { success_codes: Some(vec![200, 70000]), ..valid_check() },
            CheckFields { timeout_seconds: Some(0), ..valid_check() },
            CheckFields { timeout_seconds: Some(6), ..valid_check() },
            CheckFields { timeout_seconds: None, ..valid_check() },
        ];
        for case in cases {
            let err = h.checks().create(&token, case).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)));
        }
        assert!(h.store().list(CHECKS).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn create_requires_a_valid_token() {
        let h = Harness::new(5).await;
        let err = h.checks().create("cccccccccccccccccccc", valid_check()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn quota_stops_creation_without_side_effects() {
        let h = Harness::new(2).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        h.checks().create(&token, valid_check()).await.expect("create");
        h.checks().create(&token, valid_check()).await.expect("create");

        let err = h.checks().create(&token, valid_check()).await.unwrap_err();

        assert!(matches!(err, ServiceError::QuotaExceeded { max: 2 }));
        assert_eq!(h.store().list(CHECKS).await.expect("list").len(), 2);
        let account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        assert_eq!(account.checks.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_creates_respect_the_quota() {
        let h = Arc::new(Harness::new(3).await);
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;

        let mut joins = Vec::new();
        for _ in 0..10 {
            let (h, token) = (Arc::clone(&h), token.clone());
            joins.push(tokio::spawn(async move {
                h.checks().create(&token, valid_check()).await
            }));
        }
        let mut created = 0;
        for join in joins {
            match join.await.expect("join") {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, ServiceError::QuotaExceeded { .. })),
            }
        }

        assert_eq!(created, 3);
        assert_eq!(h.store().list(CHECKS).await.expect("list").len(), 3);
        let account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        assert_eq!(account.checks.len(), 3);
    }

    #[tokio::test]
    async fn foreign_tokens_are_forbidden_and_missing_ids_not_found() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        h.register("5557654321", "pw").await;
        let token = h.login("5551234567", "pw").await;
        let other = h.login("5557654321", "pw").await;
        let check = h.checks().create(&token, valid_check()).await.expect("create");

        assert!(matches!(
            h.checks().get(&check.id, &other).await.unwrap_err(),
            ServiceError::Forbidden
        ));
        assert!(matches!(
            h.checks().delete(&check.id, &other).await.unwrap_err(),
            ServiceError::Forbidden
        ));
        let changes = CheckFields { url: Some("evil.com".to_string()), ..Default::default() };
        assert!(matches!(
            h.checks().update(&check.id, &other, changes).await.unwrap_err(),
            ServiceError::Forbidden
        ));
        assert!(matches!(
            h.checks().get("dddddddddddddddddddd", &token).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert_eq!(h.checks().get(&check.id, &token).await.expect("get"), check);
    }

    #[tokio::test]
    async fn update_changes_only_supplied_fields() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        let check = h.checks().create(&token, valid_check()).await.expect("create");

        let updated = h
            .checks()
            .update(
                &check.id,
                &token,
                CheckFields {
                    method: Some("post".to_string()),
                    timeout_seconds: Some(5),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        assert_eq!(updated.method, HttpMethod::Post);
        assert_eq!(updated.timeout_seconds, 5);
        assert_eq!(updated.url, check.url);
        assert_eq!(updated.protocol, check.protocol);

        let err = h.checks().update(&check.id, &token, CheckFields::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        let bad = CheckFields { timeout_seconds: Some(9), ..Default::default() };
        assert!(h.checks().update(&check.id, &token, bad).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_record_and_list_entry() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        let keep = h.checks().create(&token, valid_check()).await.expect("create");
        let gone = h.checks().create(&token, valid_check()).await.expect("create");

        h.checks().delete(&gone.id, &token).await.expect("delete");

        assert!(h.store().read(CHECKS, &gone.id).await.unwrap_err().is_not_found());
        let account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        assert_eq!(account.checks, vec![keep.id]);
    }

    #[tokio::test]
    async fn delete_succeeds_when_id_already_left_the_list() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        let check = h.checks().create(&token, valid_check()).await.expect("create");
        let mut account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        account.checks.clear();
        h.store().update_as(USERS, "5551234567", &account).await.expect("update");

        h.checks().delete(&check.id, &token).await.expect("delete");
        assert!(h.store().list(CHECKS).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn repair_rebuilds_list_from_owned_checks() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        let a = h.checks().create(&token, valid_check()).await.expect("create");
        let b = h.checks().create(&token, valid_check()).await.expect("create");

        let mut account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        account.checks = vec![b.id.clone(), "staleeeeeeeeeeeeeeee".to_string()];
        h.store().update_as(USERS, "5551234567", &account).await.expect("update");

        assert!(h.checks().repair_check_list("5551234567").await.expect("repair"));
        let account: Account = h.store().read_as(USERS, "5551234567").await.expect("read");
        assert_eq!(account.checks, vec![b.id, a.id]);

        assert!(!h.checks().repair_check_list("5551234567").await.expect("repair"));
    }

    #[tokio::test]
    async fn purge_orphaned_leaves_live_accounts_alone() {
        let h = Harness::new(5).await;
        h.register("5551234567", "pw").await;
        let token = h.login("5551234567", "pw").await;
        h.checks().create(&token, valid_check()).await.expect("create");

        assert_eq!(h.checks().purge_orphaned("5551234567").await.expect("purge"), 0);
        assert_eq!(h.store().list(CHECKS).await.expect("list").len(), 1);

        h.store().delete(USERS, "5551234567").await.expect("delete");
        assert_eq!(h.checks().purge_orphaned("5551234567").await.expect("purge"), 1);
        assert!(h.store().list(CHECKS).await.expect("list").is_empty());
    }
}
