//! Error taxonomy of the chat core. None of these are fatal; each is scoped to the session,
//! conversation or message it came from.

use crate::core::models::Role;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("authentication service unavailable: {0}")]
    Unavailable(String),

    #[error("session expired, please sign in again")]
    TokenExpired,

    #[error("not signed in as {0}")]
    NotSignedIn(Role),

    #[error("this account is a {actual} account, not a {expected} account")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("email {0} is already registered")]
    EmailTaken(String),
}

/// Failure reported by the query service. Carries an HTTP-like status for display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("service temporarily unavailable: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    Validation(String),
}

impl RepositoryError {
    pub fn status(&self) -> u16 {
        match self {
            RepositoryError::NotFound(_) => 404,
            RepositoryError::Forbidden(_) => 403,
            RepositoryError::Transient(_) => 503,
            RepositoryError::Validation(_) => 422,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("realtime feed disconnected: {0}")]
    Disconnected(String),

    #[error("connection lost after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("invalid object path `{0}`")]
    InvalidPath(String),

    #[error("upload failed: {0}")]
    Upload(String),
}

/// Errors returned to callers of the chat controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("conversation {0} is not the selected conversation")]
    NotSelected(Uuid),

    #[error("message is empty")]
    EmptyMessage,

    #[error("chat is not initialized")]
    NotInitialized,

    #[error("no failed message with id {0}")]
    UnknownMessage(Uuid),

    #[error("chat controller has shut down")]
    Closed,
}
