use thiserror::Error;

use super::database::DatabaseError;
use super::history::HistoryError;
use super::media::MediaError;
use super::transport::TransportError;

pub type Result<T> = core::result::Result<T, RoomkeeperError>;

#[derive(Error, Debug)]
pub enum RoomkeeperError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Sync worker is not running")]
    WorkerUnavailable,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
