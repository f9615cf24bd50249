use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

use crate::pending::{OutgoingMessage, PendingError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no conversation is open")]
    NoActiveConversation,
    #[error("conversation {0} is no longer active")]
    StaleConversation(ConversationId),
    #[error(transparent)]
    Pending(#[from] PendingError),
    #[error("message could not be sent: {reason}")]
    SendRejected {
        /// Original composer input, to be put back in front of the user.
        restored: OutgoingMessage,
        reason: String,
    },
    #[error("backing store rejected the request: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ChatError {
    /// Normalizes errors coming out of the `anyhow`-based seams, keeping
    /// structured API errors structured.
    pub fn from_seam(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api) => Self::Api(api),
            Err(other) => Self::Transport(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed realtime frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
