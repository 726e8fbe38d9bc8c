//! Driver error taxonomy

use core::fmt;

use crate::host::{TransferError, TransferErrorKind};

/// Error reported by every layer of the driver
///
/// Transport faults (stall, NAK) are resolved close to the wire and only surface
/// here once recovery is exhausted. Sense-derived conditions propagate unchanged
/// up to the block device surface.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The device failed the command or answered with garbage
    DeviceError,
    /// No medium in the drive
    NoMedia,
    /// The medium was changed since the caller last looked at it
    MediaChanged,
    /// The medium or the logical unit refuses writes
    WriteProtected,
    /// The device is still becoming ready. Worth retrying
    NotReady,
    /// Sense data carried no usable information
    NoResponse,
    /// Out of range LBA, malformed CDB or a request the device rejected
    InvalidParameter,
    /// Buffer length is not a multiple of the block size
    BadBufferSize,
    /// A transfer did not complete in time
    Timeout,
    /// Interface, transport or peripheral type is not handled by this driver
    Unsupported,
    /// A fixed-capacity table is full
    OutOfResources,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::DeviceError => "device error",
            Error::NoMedia => "no media",
            Error::MediaChanged => "media changed",
            Error::WriteProtected => "write protected",
            Error::NotReady => "not ready",
            Error::NoResponse => "no response",
            Error::InvalidParameter => "invalid parameter",
            Error::BadBufferSize => "bad buffer size",
            Error::Timeout => "timeout",
            Error::Unsupported => "unsupported",
            Error::OutOfResources => "out of resources",
        };
        f.write_str(msg)
    }
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        match err.kind {
            TransferErrorKind::Timeout => Error::Timeout,
            TransferErrorKind::Nak => Error::NotReady,
            TransferErrorKind::Stall
            | TransferErrorKind::Crc
            | TransferErrorKind::Babble
            | TransferErrorKind::System => Error::DeviceError,
        }
    }
}

/// Driver result
pub type Result<T> = core::result::Result<T, Error>;
