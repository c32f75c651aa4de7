use crate::diagnostics::Diagnostics;

/// Errors surfaced by the ADB protocol engine.
///
/// Transient transport errors (`TransportTransient`) and malformed frames
/// (`InvalidFrame`) never reach a caller: they are recovered internally by
/// the USB transport and the session read loop respectively. Everything
/// else propagates, after which the session is unusable and the caller
/// must reconnect.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no ADB interface found on the selected USB device")]
    NoAdbInterface,

    #[error("ADB interface is claimed by another process (is a local adb server running?)")]
    Busy,

    #[error("device disconnected")]
    Disconnected { diagnostics: Diagnostics },

    #[error("operation timed out")]
    Timeout { diagnostics: Diagnostics },

    #[error("device rejected host authentication")]
    AuthRejected { diagnostics: Diagnostics },

    #[error("stream open refused by device")]
    Rejected { diagnostics: Diagnostics },

    #[error("payload of {len} bytes exceeds negotiated max_payload of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("stream is closed")]
    Closed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn internal(cause: impl Into<anyhow::Error>) -> Self {
        Error::Internal(cause.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Internal-only error values. These never reach a caller: `InvalidFrame`
// causes the read loop to drop the frame and resynchronise; `TransportTransient`
// drives the USB transport's clear-halt-and-retry budget.
#[derive(Debug, thiserror::Error)]
pub(crate) enum InternalError {
    #[error("frame failed magic check")]
    InvalidFrame,

    #[error("transient USB transfer error: {0}")]
    TransportTransient(#[source] rusb::Error),
}
