//! Error types for client operations.

use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// A parsed JSON object body, as attached to protocol errors for diagnostics.
pub type ResponseBody = Map<String, Value>;

/// Errors that can occur during client operations.
///
/// Protocol failures carry the operation's key identifier, the HTTP status
/// code and the raw parsed body, so callers can decide whether to retry,
/// surface the failure, or treat it as fatal.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or transport failure before an HTTP status was known.
    #[error("transport error: {message}")]
    Transport {
        /// Error message from the transport.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// HTTP succeeded but the body was not a JSON object.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The homeserver address is not a well-formed absolute URI.
    #[error("invalid homeserver address: {0}")]
    InvalidHomeserver(String),

    /// The server answered with a failure status code.
    #[error("server returned status {status}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Logging in failed.
    #[error("login for {user} failed with status {status}")]
    LoginFailed {
        /// The user that attempted to log in.
        user: String,
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Logging out failed; the access token is still valid.
    #[error("logout failed with status {status}")]
    LogoutFailed {
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Fetching the joined-room list failed.
    #[error("fetching room list failed with status {status}")]
    RoomListFailed {
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Joining a room failed.
    #[error("joining room {room} failed with status {status}")]
    JoinRoomFailed {
        /// The room id or alias that was attempted.
        room: String,
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Leaving a room failed.
    #[error("leaving room {room_id} failed with status {status}")]
    LeaveRoomFailed {
        /// The room id that was attempted.
        room_id: String,
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// Sending a message failed.
    #[error("sending message to {room_id} failed with status {status}")]
    SendMessageFailed {
        /// The target room id.
        room_id: String,
        /// HTTP status code.
        status: u16,
        /// Parsed response body.
        response: ResponseBody,
    },

    /// The client was used after a successful logout.
    #[error("client is logged out and can no longer be used")]
    LoggedOut,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if retrying the operation might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::UnexpectedStatus { status, .. } => retryable_status(*status),
            _ => false,
        }
    }

    /// Returns the machine-readable `errcode` field of the attached response
    /// body, if this error carries one.
    pub fn error_code(&self) -> Option<&str> {
        self.response()
            .and_then(|r| r.get("errcode"))
            .and_then(Value::as_str)
    }

    /// Returns the human-readable `error` field of the attached response
    /// body, if this error carries one.
    pub fn error_message(&self) -> Option<&str> {
        self.response().and_then(|r| r.get("error")).and_then(Value::as_str)
    }

    fn response(&self) -> Option<&ResponseBody> {
        match self {
            ClientError::UnexpectedStatus { response, .. }
            | ClientError::LoginFailed { response, .. }
            | ClientError::LogoutFailed { response, .. }
            | ClientError::RoomListFailed { response, .. }
            | ClientError::JoinRoomFailed { response, .. }
            | ClientError::LeaveRoomFailed { response, .. }
            | ClientError::SendMessageFailed { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Whether a failure status is worth retrying: rate limiting and server-side
/// failures are, client mistakes are not.
fn retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
