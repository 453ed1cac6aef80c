//! Typed decode failures for the wire codec.

use thiserror::Error;

/// A frame that cannot be interpreted.
///
/// The protocol carries no resynchronization marker, so callers do not try
/// to reread after any of these; the connection is treated as lost.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The kind byte does not name a known packet kind.
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    /// The length byte exceeds the payload capacity.
    #[error("payload length {0} exceeds frame capacity")]
    BadLength(u8),
}
