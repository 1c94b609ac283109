use thiserror::Error;

use crate::models::EventId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid slug: {0}")]
    InvalidSlug(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Event with ID {0} does not exist. Cannot create booking for non-existent event.")]
    EventMissing(EventId),

    #[error("Failed to verify event existence for ID {id}: {source}")]
    VerificationFailed {
        id: EventId,
        #[source]
        source: Box<Error>,
    },

    #[error("Database connection failed: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be reported to a caller on the other side of a
/// request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorClass {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorClass::BadRequest => 400,
            ErrorClass::NotFound => 404,
            ErrorClass::Unavailable => 503,
            ErrorClass::Internal => 500,
        }
    }
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_)
            | Error::InvalidSlug(_)
            | Error::EventMissing(_) => ErrorClass::BadRequest,
            Error::VerificationFailed { source, .. } => source.class(),
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::Unavailable(_) => ErrorClass::Unavailable,
            Error::Storage(_) | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("payload encoding failed: {err}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(err.to_string())
    }
}
