//! Error types.

use thiserror::Error;

/// Result alias for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Error-kind tag surfaced to applications.
///
/// The numeric values follow the order libunbound uses for its context
/// error constants, so callers bridging to C can pass them through as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error.
    NoError = 0,
    /// Allocation failure.
    OutOfMemory = -1,
    /// A channel to the worker is broken.
    TransportFailure = -2,
    /// Malformed query parameters or option values.
    SyntaxError = -3,
    /// The worker reported that resolution failed.
    ResolutionFailed = -4,
    /// Finalization could not construct the shared state.
    InitializationFailed = -5,
    /// Configuration change attempted after finalization.
    AfterFinal = -6,
    /// The query identifier space is exhausted.
    Capacity = -7,
}

impl ErrorCode {
    /// Returns the wire status byte used in result frames.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub const fn status(self) -> u8 {
        (-(self as i32)) as u8
    }

    /// Inverse of [`status`](Self::status).
    #[must_use]
    pub const fn from_status(status: u8) -> Option<Self> {
        Some(match status {
            0 => Self::NoError,
            1 => Self::OutOfMemory,
            2 => Self::TransportFailure,
            3 => Self::SyntaxError,
            4 => Self::ResolutionFailed,
            5 => Self::InitializationFailed,
            6 => Self::AfterFinal,
            7 => Self::Capacity,
            _ => return None,
        })
    }
}

/// Failures of the framed byte-stream channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed the stream at a frame boundary.
    #[error("channel closed")]
    Closed,

    /// The stream carried a malformed or truncated frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying pipe failed (typically `BrokenPipe` once the worker is gone).
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by context operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// An allocation for a record, arena or context field failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The request or result channel is broken.
    #[error("transport failure: {0}")]
    Transport(#[from] ChannelError),

    /// Query name, type, class or option value is malformed.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The worker answered with a failure.
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// Finalization could not build the module pipeline or shared caches.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The context is finalized and its configuration is frozen.
    #[error("configuration is frozen after finalization")]
    AfterFinal,

    /// Every query identifier is in use.
    #[error("query identifier space exhausted ({max} ids)")]
    Capacity {
        /// Size of the identifier space.
        max: u32,
    },
}

impl ContextError {
    /// Returns the error-kind tag for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::Transport(_) => ErrorCode::TransportFailure,
            Self::Syntax(_) => ErrorCode::SyntaxError,
            Self::ResolutionFailed(_) => ErrorCode::ResolutionFailed,
            Self::InitializationFailed(_) => ErrorCode::InitializationFailed,
            Self::AfterFinal => ErrorCode::AfterFinal,
            Self::Capacity { .. } => ErrorCode::Capacity,
        }
    }

    /// Returns `true` if the worker went away (end-of-stream on a channel).
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(ChannelError::Closed))
    }

    /// Message carried next to the status byte in a result frame.
    pub(crate) fn wire_message(&self) -> String {
        match self {
            Self::Syntax(m) | Self::ResolutionFailed(m) | Self::InitializationFailed(m) => {
                m.clone()
            }
            other => other.to_string(),
        }
    }

    /// Rebuilds an error received from the worker as a status byte and message.
    pub(crate) fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::OutOfMemory => Self::OutOfMemory,
            ErrorCode::TransportFailure => Self::Transport(ChannelError::Protocol(message)),
            ErrorCode::SyntaxError => Self::Syntax(message),
            ErrorCode::InitializationFailed => Self::InitializationFailed(message),
            ErrorCode::AfterFinal => Self::AfterFinal,
            ErrorCode::Capacity => Self::Capacity { max: 0 },
            ErrorCode::NoError | ErrorCode::ResolutionFailed => Self::ResolutionFailed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_roundtrips_every_code() {
        for code in [
            ErrorCode::NoError,
            ErrorCode::OutOfMemory,
            ErrorCode::TransportFailure,
            ErrorCode::SyntaxError,
            ErrorCode::ResolutionFailed,
            ErrorCode::InitializationFailed,
            ErrorCode::AfterFinal,
            ErrorCode::Capacity,
        ] {
            assert_eq!(ErrorCode::from_status(code.status()), Some(code));
        }
        assert_eq!(ErrorCode::from_status(200), None);
    }

    #[test]
    fn codes_match_variants() {
        assert_eq!(ContextError::OutOfMemory.code(), ErrorCode::OutOfMemory);
        assert_eq!(
            ContextError::Transport(ChannelError::Closed).code(),
            ErrorCode::TransportFailure
        );
        assert_eq!(
            ContextError::Syntax("x".into()).code(),
            ErrorCode::SyntaxError
        );
        assert_eq!(ContextError::Capacity { max: 4 }.code(), ErrorCode::Capacity);
    }

    #[test]
    fn closed_is_distinct_from_protocol() {
        assert!(ContextError::Transport(ChannelError::Closed).is_closed());
        assert!(!ContextError::Transport(ChannelError::Protocol("short".into())).is_closed());
    }
}
