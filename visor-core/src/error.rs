//! Domain-specific error types for the Visor protocol and engine.
//!
//! All fallible operations return `Result<T, VisorError>`.
//! No panics on invalid input — every error is typed and recoverable.
//! Errors local to one connection never propagate to other
//! connections or to the capture pipeline.

use std::time::Duration;
use thiserror::Error;

use crate::frame::FrameKind;

/// The canonical error type for the Visor protocol.
#[derive(Debug, Error)]
pub enum VisorError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The stream ended (or a buffer ran out) in the middle of a frame.
    #[error("truncated frame: stream ended mid-frame")]
    Incomplete,

    /// A kind tag did not map to any known frame kind.
    #[error("unknown frame kind tag: {tag:#x}")]
    UnknownKind { tag: u32 },

    /// The first frame of a connection was not `Authenticate`.
    #[error("expected Authenticate as first frame, got {got}")]
    ExpectedAuth { got: FrameKind },

    /// A string field exceeds the 2-byte length prefix.
    #[error("string field too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// A declared frame length exceeds the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A known kind arrived on the wrong side of the connection
    /// (e.g. a `ScreenFrame` sent client→host).
    #[error("frame kind {kind} is not valid in this direction")]
    WrongDirection { kind: FrameKind },

    /// UTF-8 conversion of a string field failed.
    #[error("invalid utf-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ── Auth Errors ──────────────────────────────────────────────
    /// The handshake was rejected (bad password, duplicate name).
    #[error("authentication rejected: {message}")]
    Auth { message: String },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel to a session task was closed unexpectedly.
    #[error("session channel closed")]
    ChannelClosed,

    /// An outbound push exceeded its deadline (stalled peer).
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// The platform collaborator failed to capture the screen.
    #[error("screen capture failed: {0}")]
    Capture(String),

    /// Lossy image encoding failed.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// Input injection failed at the platform collaborator.
    #[error("input injection failed: {0}")]
    Inject(String),

    // ── Persistence Errors ───────────────────────────────────────
    /// The document store is unavailable or rejected an operation.
    /// Always logged, never fatal to a protocol operation.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl VisorError {
    /// Shorthand for an auth rejection with the given message.
    pub fn auth(message: impl Into<String>) -> Self {
        VisorError::Auth {
            message: message.into(),
        }
    }
}
