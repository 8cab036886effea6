/*!
Error taxonomy shared by every manager, and its mapping onto status codes
*/

use thiserror::Error;
use uptime_store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Missing required token in header, or token is invalid")]
    Unauthorized,
    #[error("Token is not valid for the owner of this resource")]
    Forbidden,
    #[error("Phone number or password did not match")]
    InvalidCredentials,
    #[error("The token has already expired and cannot be extended")]
    Expired,
    #[error("The user already has the maximum number of checks ({max})")]
    QuotaExceeded { max: usize },
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Stored data is corrupt")]
    Corrupt(#[source] StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Deleted the user, but could not delete {failed} of its checks")]
    IncompleteCleanup { failed: usize },
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::InvalidInput(_)
            | ServiceError::Conflict(_)
            | ServiceError::InvalidCredentials
            | ServiceError::Expired
            | ServiceError::QuotaExceeded { .. } => 400,
            ServiceError::Unauthorized | ServiceError::Forbidden => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::MethodNotAllowed => 405,
            ServiceError::Corrupt(_)
            | ServiceError::Internal(_)
            | ServiceError::IncompleteCleanup { .. } => 500,
        }
    }

    /// Message safe to show to a caller
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn missing_fields() -> Self {
        ServiceError::InvalidInput("Missing required fields".to_string())
    }

    pub fn nothing_to_update() -> Self {
        ServiceError::InvalidInput("Missing fields to update".to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists { collection, .. } => ServiceError::Conflict(format!(
                "The specified {} already exists",
                singular(&collection)
            )),
            StoreError::NotFound { collection, .. } => ServiceError::NotFound(format!(
                "The specified {} does not exist",
                singular(&collection)
            )),
            StoreError::InvalidName(_) => {
                ServiceError::InvalidInput("Identifier contains invalid characters".to_string())
            }
            corrupt @ StoreError::Corrupt { .. } => ServiceError::Corrupt(corrupt),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

fn singular(collection: &str) -> &str {
    collection.strip_suffix('s').unwrap_or(collection)
}
