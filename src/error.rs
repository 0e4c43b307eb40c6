//! Error types.

use crate::channel::MessageId;
use thiserror::Error;

/// A specialized [`Result`][std::result::Result] type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while forging keys, querying reports, or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No valid key was found for a bit within the attempt cap.
    #[error("no valid key for bit {position} = {value} after {attempts} attempts")]
    KeyForgeExhausted {
        /// Bit position being forged.
        position: u32,
        /// Bit value being forged.
        value: bool,
        /// Number of candidates tested.
        attempts: u32,
    },

    /// The authentication collaborator did not supply a usable token.
    #[error("search party token unavailable: {0}")]
    AuthTokenUnavailable(String),

    /// The report service call failed or timed out.
    #[error("report query failed: {0}")]
    ReportQueryFailed(String),

    /// Both candidate keys of one position received reports.
    #[error("both values of bit {position} were reported")]
    DecodeAmbiguous {
        /// The contested bit position.
        position: u32,
    },

    /// A returned report could not be parsed.
    #[error("malformed report payload: {0}")]
    MalformedReportPayload(String),

    /// No message with this id is registered.
    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    /// A round for this message is already running.
    #[error("a round for message {0} is already in flight")]
    RoundInFlight(MessageId),

    /// The round was cancelled before it committed.
    #[error("round cancelled")]
    Cancelled,

    /// A key search task died before returning.
    #[error("forge task failed: {0}")]
    ForgeTaskFailed(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns `true` if retrying the same operation may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AuthTokenUnavailable(_) | Self::ReportQueryFailed(_) | Self::RoundInFlight(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedReportPayload(e.to_string())
    }
}
