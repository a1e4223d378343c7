use serde::Serialize;
use thiserror::Error;

use crate::api::ApiError;
use crate::markup::MarkupError;

/// Why a single page did not reach `Done`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("malformed markup: {0}")]
    MalformedMarkup(#[from] MarkupError),
    #[error("page carries none of the marker labels: {}", .markers.join(", "))]
    ValidationRejected { markers: Vec<String> },
    #[error("{failed} label removal(s) failed")]
    LabelRemoval { failed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    VersionConflict,
    Conflict,
    Transport,
    MalformedMarkup,
    ValidationRejected,
    LabelRemoval,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api(ApiError::NotFound(_)) => ErrorKind::NotFound,
            Self::Api(ApiError::Unauthorized(_)) => ErrorKind::Unauthorized,
            Self::Api(ApiError::VersionConflict { .. }) => ErrorKind::VersionConflict,
            Self::Api(ApiError::Conflict(_)) => ErrorKind::Conflict,
            Self::Api(ApiError::Transport(_) | ApiError::Decode(_)) => ErrorKind::Transport,
            Self::MalformedMarkup(_) => ErrorKind::MalformedMarkup,
            Self::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            Self::LabelRemoval { .. } => ErrorKind::LabelRemoval,
        }
    }
}

impl ErrorKind {
    /// Authorization failures stop the whole run, not just one page.
    pub fn aborts_batch(self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}
