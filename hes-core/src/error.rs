//! # error
//!
//! Typed error kinds surfaced by the protocol engine (spec §7).
//!
//! ## Propagation policy
//! - `Timeout`, `CommandInProgress`, `ChecksumError`, `InvalidResponse` and
//!   `DlmsConnectionFailed` are recovered locally by the transactor's retry
//!   ladder — they never reach the scheduler as a terminal failure on their
//!   own, only after the ladder is exhausted.
//! - Everything else is surfaced to the caller as a typed outcome and
//!   recorded under the matching `RequestStatus` in the store.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormatError {
    TooShort,
    BadStart,
    LengthMismatch,
    BadChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Disconnect,
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareIoError {
    NotFound,
    Read,
    Write,
    Open,
    SizeMismatch,
}

/// Top-level engine error. Every core operation that can fail returns this.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("wire format error: {0:?}")]
    WireFormat(WireFormatError),
    #[error("transport error: {0:?}")]
    Transport(TransportError),
    /// pmesh error codes 0..0x0C
    #[error("mesh protocol error code {0:#04x}")]
    MeshProtocol(u8),
    /// carries the meter's DLMS error word verbatim
    #[error("dlms error code {0:#06x}")]
    DlmsError(u16),
    #[error("dlms connection failed")]
    DlmsConnectionFailed,
    #[error("firmware io error: {0:?}")]
    FirmwareIo(FirmwareIoError),
}

impl From<WireFormatError> for EngineError {
    fn from(e: WireFormatError) -> Self {
        EngineError::WireFormat(e)
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        EngineError::Transport(e)
    }
}

impl From<FirmwareIoError> for EngineError {
    fn from(e: FirmwareIoError) -> Self {
        EngineError::FirmwareIo(e)
    }
}
