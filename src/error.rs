//! Error taxonomy (§7): sum types, not exception classes.

use thiserror::Error;

/// Errors surfaced by a [`crate::backend::UsbBackend`] and by the engine's
/// direct use of bulk/control transfers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("timed out waiting for {0:?}")]
    TimeoutInPhase(TransferPhase),
    #[error("device or endpoint busy")]
    Busy,
    #[error("access denied")]
    AccessDenied,
    #[error("device is gone")]
    NoDevice,
    #[error("endpoint stalled")]
    Stall,
    #[error("i/o error: {message}")]
    Io { message: String },
}

/// The phase a `TimeoutInPhase` occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    BulkOut,
    BulkIn,
    ResponseWait,
}

impl TransportError {
    /// `true` for a write timeout that made no progress at all, the one
    /// class the engine retries locally (§7 "Propagation").
    pub fn is_no_progress_write_timeout(&self, bytes_transferred: usize) -> bool {
        matches!(self, TransportError::Timeout) && bytes_transferred == 0
    }
}

/// Errors from parsing PTP datasets out of untrusted device bytes (§4.8).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("input truncated at byte {at}")]
    Truncated { at: usize },
    #[error("invalid string encoding")]
    InvalidString,
    #[error("dataset could not be parsed")]
    ParseFailed,
}

/// Top-level error type returned by [`crate::link::Link`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MtpError {
    #[error("protocol error {code:#06x}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    ProtocolError { code: u16, message: Option<String> },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("not supported: {message}")]
    NotSupported { message: String },

    #[error("object not found")]
    ObjectNotFound,

    #[error("storage full")]
    StorageFull,

    #[error("storage is read-only")]
    ReadOnly,

    #[error("object is write-protected")]
    ObjectWriteProtected,

    #[error("operation cancelled")]
    Cancelled,
}

/// Standard PTP response codes the core assigns specific meaning to (§7).
pub mod response_code {
    pub const OK: u16 = 0x2001;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
    pub const DEVICE_BUSY: u16 = 0x2019;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const OBJECT_NOT_FOUND: u16 = 0x2009;
    pub const STORAGE_FULL: u16 = 0x200D;
    pub const STORE_READ_ONLY: u16 = 0x200E;
    pub const TRANSACTION_CANCELLED: u16 = 0x2012;
    pub const PARAMETER_NOT_SUPPORTED: u16 = 0x201D;
}

/// Maps a PTP response code to an [`MtpError`], per §7's mapping table.
/// Returns `None` for `OK` and for the `OpenSession` idempotent-success case,
/// both of which the caller treats as success rather than error.
pub fn map_response_code(code: u16) -> Option<MtpError> {
    use response_code::*;
    match code {
        OK => None,
        DEVICE_BUSY => Some(MtpError::Transport(TransportError::Busy)),
        OPERATION_NOT_SUPPORTED | PARAMETER_NOT_SUPPORTED => Some(MtpError::NotSupported {
            message: format!("response code {code:#06x}"),
        }),
        OBJECT_NOT_FOUND => Some(MtpError::ObjectNotFound),
        STORAGE_FULL => Some(MtpError::StorageFull),
        STORE_READ_ONLY => Some(MtpError::ReadOnly),
        TRANSACTION_CANCELLED => Some(MtpError::Transport(TransportError::Timeout)),
        other => Some(MtpError::ProtocolError {
            code: other,
            message: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_maps_to_none() {
        assert_eq!(map_response_code(response_code::OK), None);
    }

    #[test]
    fn unknown_code_is_protocol_error() {
        match map_response_code(0x2FFF) {
            Some(MtpError::ProtocolError { code, .. }) => assert_eq!(code, 0x2FFF),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn no_progress_write_timeout() {
        let e = TransportError::Timeout;
        assert!(e.is_no_progress_write_timeout(0));
        assert!(!e.is_no_progress_write_timeout(5));
        assert!(!TransportError::Busy.is_no_progress_write_timeout(0));
    }
}
