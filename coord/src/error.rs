use crate::LeaseId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot reach coordination service: {0}")]
    Connection(String),

    #[error("Coordination service rejected request (code {code}): {message}")]
    Gateway { code: i32, message: String },

    #[error("Lease {lease} not found")]
    LeaseNotFound { lease: LeaseId },

    #[error("Lease {lease} expired")]
    LeaseExpired { lease: LeaseId },

    #[error("Session is closed")]
    SessionClosed,

    #[error("The elector is not leader")]
    NotLeader,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session TTL must be at least one second")]
    InvalidTtl,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The expected negative answer of a leadership check.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::NotLeader)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The lease behind a session no longer exists on the service.
    pub fn is_lease_gone(&self) -> bool {
        matches!(self, Error::LeaseNotFound { .. } | Error::LeaseExpired { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
