/*!
Session tokens: issuing, verifying, extending and revoking them
*/

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};
use uptime_store::{RecordStore, RecordStoreExt, StoreError};

use crate::core::{
    clock::Clock,
    credentials::Credentials,
    error::{ServiceError, ServiceResult},
    models::{Account, PHONE_LEN, SessionToken, TOKEN_ID_LEN, TOKENS, USERS},
};

/// Tokens live for exactly one hour from issue or extension
pub const TOKEN_LIFETIME_SECS: i64 = 60 * 60;

pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    credentials: Arc<Credentials>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        credentials: Arc<Credentials>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            credentials,
            clock,
        }
    }

    fn lifetime() -> Duration {
        Duration::seconds(TOKEN_LIFETIME_SECS)
    }

    /// Exchange a phone number and password for a fresh token
    pub async fn login(&self, phone: &str, password: &str) -> ServiceResult<SessionToken> {
        let phone = phone.trim();
        let password = password.trim();
        if phone.chars().count() != PHONE_LEN || password.is_empty() {
            return Err(ServiceError::missing_fields());
        }

        let account: Account = match self.store.read_as(USERS, phone).await {
            Ok(account) => account,
            Err(e) if e.is_not_found() => return Err(ServiceError::InvalidCredentials),
            Err(e) => return Err(e.into()),
        };

        if !self.credentials.matches(password, &account.hashed_password) {
            info!("Rejected login for {}: password mismatch", phone);
            return Err(ServiceError::InvalidCredentials);
        }

        let id = Credentials::random_identifier(TOKEN_ID_LEN)
            .ok_or_else(|| ServiceError::Internal("could not generate a token id".to_string()))?;
        let token = SessionToken {
            id,
            phone: account.phone,
            expires: self.clock.now() + Self::lifetime(),
        };

        self.store.create_as(TOKENS, &token.id, &token).await?;
        info!("Issued session token for {}, expires {}", token.phone, token.expires);
        debug!("New token id {}", token.id);
        Ok(token)
    }

    /// The stored token, expired or not
    pub async fn lookup(&self, token_id: &str) -> ServiceResult<SessionToken> {
        let token_id = valid_token_id(token_id)?;
        Ok(self.store.read_as(TOKENS, token_id).await?)
    }

    /// Whether `token_id` currently grants access to the account `phone`.
    /// Never fails; any problem reading the token means "no".
    pub async fn verify(&self, token_id: &str, phone: &str) -> bool {
        let token_id = token_id.trim();
        if token_id.chars().count() != TOKEN_ID_LEN {
            return false;
        }

        match self.store.read_as::<SessionToken>(TOKENS, token_id).await {
            Ok(token) => token.phone == phone.trim() && token.is_active_at(self.clock.now()),
            Err(e) => {
                if !e.is_not_found() {
                    warn!("Could not verify token: {}", e);
                }
                false
            }
        }
    }

    /// Phone number of the account an active token belongs to
    pub async fn owner_of(&self, token_id: &str) -> ServiceResult<String> {
        let token_id = token_id.trim();
        if token_id.chars().count() != TOKEN_ID_LEN {
            return Err(ServiceError::Unauthorized);
        }

        let token: SessionToken = match self.store.read_as(TOKENS, token_id).await {
            Ok(token) => token,
            Err(e) if e.is_not_found() => return Err(ServiceError::Unauthorized),
            Err(StoreError::InvalidName(_)) => return Err(ServiceError::Unauthorized),
            Err(e) => return Err(e.into()),
        };

        if token.is_active_at(self.clock.now()) {
            Ok(token.phone)
        } else {
            Err(ServiceError::Unauthorized)
        }
    }

    /// Push an active token's expiry to one hour from now
    pub async fn extend(&self, token_id: &str) -> ServiceResult<SessionToken> {
        let token_id = valid_token_id(token_id)?;
        let mut token: SessionToken = self.store.read_as(TOKENS, token_id).await?;

        let now = self.clock.now();
        if !token.is_active_at(now) {
            return Err(ServiceError::Expired);
        }

        token.expires = token.expires.max(now + Self::lifetime());
        self.store.update_as(TOKENS, token_id, &token).await?;
        debug!("Extended token {} to {}", token_id, token.expires);
        Ok(token)
    }

    pub async fn revoke(&self, token_id: &str) -> ServiceResult<()> {
        let token_id = valid_token_id(token_id)?;
        self.store.delete(TOKENS, token_id).await?;
        info!("Revoked session token");
        Ok(())
    }

    /// Revoke every token issued to `phone`, returning how many were removed
    pub async fn revoke_all_for(&self, phone: &str) -> ServiceResult<usize> {
        let mut revoked = 0;
        for token in self.scan().await? {
            if token.phone == phone && self.remove(&token.id).await? {
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!("Revoked {} session tokens of {}", revoked, phone);
        }
        Ok(revoked)
    }

    /// Delete every token whose expiry has passed
    pub async fn reap_expired(&self) -> ServiceResult<usize> {
        let now = self.clock.now();
        let mut reaped = 0;
        for token in self.scan().await? {
            if !token.is_active_at(now) && self.remove(&token.id).await? {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Reaped {} expired session tokens", reaped);
        }
        Ok(reaped)
    }

    /// Delete a token, reporting whether it was still there
    async fn remove(&self, token_id: &str) -> ServiceResult<bool> {
        match self.store.delete(TOKENS, token_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable token. Records that vanish or fail to parse mid-scan
    /// are skipped.
    async fn scan(&self) -> ServiceResult<Vec<SessionToken>> {
        let mut tokens = Vec::new();
        for key in self.store.list(TOKENS).await? {
            match self.store.read_as::<SessionToken>(TOKENS, &key).await {
                Ok(token) => tokens.push(token),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Skipping unreadable token record: {}", e),
            }
        }
        Ok(tokens)
    }
}

fn valid_token_id(token_id: &str) -> ServiceResult<&str> {
    let token_id = token_id.trim();
    if token_id.chars().count() == TOKEN_ID_LEN {
        Ok(token_id)
    } else {
        Err(ServiceError::missing_fields())
    }
}
