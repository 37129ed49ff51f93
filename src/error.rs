use thiserror::Error;

use crate::presence::UserId;
use crate::room::RoomId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room '{0}' not found")]
    RoomNotFound(RoomId),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("User '{user}' is not a member of room '{room}'")]
    NotMember { room: RoomId, user: UserId },
}

impl RoomError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        RoomError::InvalidCommand(reason.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// The snapshot could not be evaluated; the previous baseline is kept.
    #[error("Alert evaluation skipped: {0}")]
    AlertEvaluationSkipped(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid bind address: {0}")]
    Bind(String),
    #[error("Failed to load TLS material: {0}")]
    Tls(String),
}
