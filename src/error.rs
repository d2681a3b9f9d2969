// ABOUTME: BEEP engine error types covering framing, sequencing and channel management
// ABOUTME: Provides structured error reporting with automatic conversion from I/O and codec errors

use crate::frame::FrameError;
use crate::mgmt::{MgmtError, ReplyCode};
use std::io;
use thiserror::Error;

/// Comprehensive error type for engine operations.
///
/// The variants follow the protocol's taxonomy: framing and sequence
/// errors tear the whole session down, channel-management errors are
/// reported back on channel 0 and leave the session running, and
/// application-level refusals leave the affected channel open.
#[derive(Debug, Error)]
pub enum BeepError {
    /// The frame codec rejected inbound or outbound data.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// A sequencing or validation invariant was violated; the session is
    /// torn down.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer answered a channel-0 request with an `<error>` document.
    #[error("peer refused: {code} {diagnostic}")]
    Refused { code: ReplyCode, diagnostic: String },

    /// A channel-0 payload could not be decoded as a management document.
    #[error("invalid management document: {0}")]
    Mgmt(#[from] MgmtError),

    /// The outstanding-MSG limit was reached in fail-fast mode.
    #[error("outstanding message limit reached")]
    OutstandingLimit,

    /// A synchronous wait hit the session reply timeout.
    #[error("operation timed out")]
    Timeout,

    /// The session is broken; every blocked waiter observes this value.
    #[error("session is not operational")]
    NotOperational,

    /// The operation is not valid in the channel's or session's current
    /// state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error on the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl BeepError {
    /// True when the error condition invalidates the whole session rather
    /// than a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BeepError::Frame(_)
                | BeepError::Protocol(_)
                | BeepError::Transport(_)
                | BeepError::NotOperational
        )
    }
}

/// Result type alias for engine operations.
pub type BeepResult<T> = Result<T, BeepError>;
