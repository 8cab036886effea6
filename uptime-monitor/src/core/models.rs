/*!
Record shapes for the `users`, `tokens` and `checks` collections, and the
loosely-typed inputs managers validate
*/

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::ServiceError;

pub const USERS: &str = "users";
pub const TOKENS: &str = "tokens";
pub const CHECKS: &str = "checks";

pub const PHONE_LEN: usize = 10;
pub const TOKEN_ID_LEN: usize = 20;
pub const CHECK_ID_LEN: usize = 20;
pub const MIN_TIMEOUT_SECONDS: u8 = 1;
pub const MAX_TIMEOUT_SECONDS: u8 = 5;

/// A registered user, keyed by phone number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub hashed_password: String,
    pub tos_agreement: bool,
    /// Ids of the checks this account owns, in creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

/// What callers get to see of an [`Account`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub tos_agreement: bool,
    pub checks: Vec<String>,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            first_name: account.first_name,
            last_name: account.last_name,
            phone: account.phone,
            tos_agreement: account.tos_agreement,
            checks: account.checks,
        }
    }
}

/// A time-bounded credential for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToken {
    pub id: String,
    pub phone: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires: DateTime<Utc>,
}

impl SessionToken {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// A periodic probe definition owned by one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: String,
    pub user_phone: String,
    pub protocol: Protocol,
    pub url: String,
    pub method: HttpMethod,
    pub success_codes: Vec<u16>,
    pub timeout_seconds: u8,
}

/// Registration input as received; nothing here has been validated yet
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub tos_agreement: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: Option<String>,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.password.is_none()
    }
}

/// Check input as received. Used both for creation, where every field is
/// required, and for partial updates.
#[derive(Debug, Clone, Default)]
pub struct CheckFields {
    pub protocol: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub success_codes: Option<Vec<i64>>,
    pub timeout_seconds: Option<i64>,
}

impl CheckFields {
    pub fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.url.is_none()
            && self.method.is_none()
            && self.success_codes.is_none()
            && self.timeout_seconds.is_none()
    }
}

impl FromStr for Protocol {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(ServiceError::InvalidInput("Protocol must be http or https".to_string())),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(HttpMethod::Get),
            "post" => Ok(HttpMethod::Post),
            "put" => Ok(HttpMethod::Put),
            "delete" => Ok(HttpMethod::Delete),
            _ => Err(ServiceError::InvalidInput(
                "Method must be one of get, post, put or delete".to_string(),
            )),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "get",
            HttpMethod::Post => "post",
            HttpMethod::Put => "put",
            HttpMethod::Delete => "delete",
        };
        f.write_str(name)
    }
}
