/*!
Errors raised by the record store
*/

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record {collection}/{key} already exists")]
    AlreadyExists { collection: String, key: String },
    #[error("record {collection}/{key} not found")]
    NotFound { collection: String, key: String },
    #[error("record {collection}/{key} does not contain valid JSON: {source}")]
    Corrupt {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record {collection}/{key} could not be encoded: {source}")]
    Encode {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o failure on {collection}/{key}: {source}")]
    Io {
        collection: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open store directory: {0}")]
    Open(#[source] std::io::Error),
    #[error("invalid collection or key name {0:?}")]
    InvalidName(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}
