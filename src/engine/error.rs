use std::fmt;

use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// No entity with this id exists.
    NotFound(Ulid),
    /// An entity with this id already exists.
    AlreadyExists(Ulid),
    /// Another account already uses this email address.
    EmailInUse(String),
    /// The requested interval is malformed or outside the booking window.
    InvalidInterval(&'static str),
    /// A field failed validation.
    Validation(&'static str),
    /// No spot in the lot can cover the requested interval.
    NoAvailability,
    /// The chosen spot gained an overlapping booking before commit.
    Conflict(Ulid),
    /// The operation would orphan live state.
    Integrity(&'static str),
    /// A configured capacity ceiling was hit.
    LimitExceeded(&'static str),
    /// The write-ahead log rejected the transaction.
    WalError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "not found: {id}"),
            Self::AlreadyExists(id) => write!(f, "already exists: {id}"),
            Self::EmailInUse(email) => write!(f, "email already registered: {email}"),
            Self::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::NoAvailability => write!(f, "no spot available for the requested interval"),
            Self::Conflict(spot_id) => {
                write!(f, "spot {spot_id} was booked concurrently, please retry")
            }
            Self::Integrity(msg) => write!(f, "integrity violation: {msg}"),
            Self::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Self::WalError(msg) => write!(f, "WAL write failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
