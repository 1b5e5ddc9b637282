//! Error taxonomy for the capture pipeline

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CameraError>;

/// Errors surfaced by the device-session core.
///
/// Validation errors and transient per-request errors leave the device
/// usable. `Fatal` is sticky: once the device enters the error state only
/// `disconnect()` is accepted.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Operation not legal in the current device or stream state.
    #[error("operation `{op}` not allowed in state `{state}`")]
    InvalidState { op: &'static str, state: String },

    /// Unknown stream id referenced by a request or API call.
    #[error("no stream with id {0}")]
    BadStreamId(i32),

    /// Malformed argument.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// A bounded wait expired.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    /// Stream hand-out counter is at its configured maximum.
    #[error("stream {stream} already has {max} buffers outstanding")]
    BufferLimit { stream: i32, max: usize },

    /// A stream cannot disconnect while buffers are still outstanding.
    #[error("stream {stream} has {outstanding} buffers outstanding")]
    BuffersOutstanding { stream: i32, outstanding: usize },

    /// The downstream consumer or upstream producer rejected a buffer op.
    #[error("buffer endpoint error: {0}")]
    Endpoint(String),

    /// Non-fatal failure reported by the hardware session.
    #[error("HAL error during `{op}`: {message}")]
    Hal { op: &'static str, message: String },

    /// The device is in the terminal error state.
    #[error("device in error state: {0}")]
    Fatal(String),

    /// The device has been disconnected.
    #[error("device disconnected")]
    Disconnected,
}

impl CameraError {
    /// True for errors that poison the device (only `disconnect()` after).
    pub fn is_fatal(&self) -> bool {
        matches!(self, CameraError::Fatal(_))
    }
}
