use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{ChunkKey, DataError, StorageLevel};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("chunk meta not found: {0}")]
    NotFound(ChunkKey),

    #[error("session {0} has no metadata directory")]
    UnknownSession(String),
}

impl MetaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("data {key} not found in session {session_id}")]
    KeyNotFound { session_id: String, key: ChunkKey },

    #[error("chunk {0} has no band holding it")]
    NoBand(ChunkKey),

    #[error("unknown node address: {0}")]
    UnknownNode(String),

    #[error("storage level {0} is not available on this node")]
    LevelUnavailable(StorageLevel),

    #[error("invalid storage level: {0}")]
    InvalidLevel(String),

    #[error("only slices and integers can be used as read conditions")]
    InvalidConditions,

    #[error("operation is not supported by this storage api: {0}")]
    Unsupported(&'static str),

    #[error("remote storage replied {status}: {message}")]
    Remote { status: u16, message: String },

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StorageError {
    /// Missing data or metadata; garbage collection treats this as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::KeyNotFound { .. } | StorageError::NoBand(_) => true,
            StorageError::Meta(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        tracing::error!("Generating storage tunnel error response: {:?}", self);

        let status_code = match &self {
            StorageError::KeyNotFound { .. } | StorageError::NoBand(_) => StatusCode::NOT_FOUND,
            StorageError::Meta(MetaError::NotFound(_)) => StatusCode::NOT_FOUND,
            StorageError::Meta(MetaError::UnknownSession(_)) => StatusCode::NOT_FOUND,
            StorageError::InvalidLevel(_)
            | StorageError::InvalidConditions
            | StorageError::Data(DataError::Codec(_)) => StatusCode::BAD_REQUEST,
            StorageError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status_code, self.to_string()).into_response()
    }
}
