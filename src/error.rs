//! Error taxonomy and status-code mapping.
//!
//! Every public operation reports failures as an [`Error`]. At the C boundary
//! an error becomes a status code: `0` is success, `1..=255` are the host's
//! `<errno.h>` values, anything else is implementation-defined.

use core::ffi::c_int;

/// `EDEVERR` only exists on Darwin.
#[cfg(target_vendor = "apple")]
const EDEVERR: c_int = libc::EDEVERR;
#[cfg(not(target_vendor = "apple"))]
const EDEVERR: c_int = libc::ENXIO;

/// Errors reported by kernel memory operations and backend negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not available with the resolved backends.
    Unsupported,
    /// The privilege mechanism exists but is disabled or forbidden.
    PermissionDenied,
    /// Invalid, overflowing range or unsupported granule.
    InvalidArgument,
    /// Attempted, nothing happened, cause unknown.
    DeviceError,
    /// Partially completed before failing; effect is indeterminate.
    Io,
    /// The kernel allocator is exhausted.
    OutOfMemory,
    /// Backend built against a handler table older than the supported floor.
    ProtocolTooOld,
    /// Backend claimed success but left required handlers empty.
    Incomplete,
    /// Any other non-zero status returned by a backend.
    Other(c_int),
}

/// Result alias used throughout the crate.
pub type KrwResult<T> = Result<T, Error>;

/// Variant ↔ status code table. Lookups in both directions go through here.
const CODES: &[(Error, c_int)] = &[
    (Error::Unsupported, libc::ENOTSUP),
    (Error::PermissionDenied, libc::EPERM),
    (Error::InvalidArgument, libc::EINVAL),
    (Error::DeviceError, EDEVERR),
    (Error::Io, libc::EIO),
    (Error::OutOfMemory, libc::ENOMEM),
    (Error::ProtocolTooOld, libc::EPROTONOSUPPORT),
    (Error::Incomplete, libc::ENOSYS),
];

impl Error {
    /// Status code for this error. Never zero.
    pub fn code(self) -> c_int {
        match self {
            // A zero status would read as success.
            Self::Other(0) => return EDEVERR,
            Self::Other(code) => return code,
            _ => {}
        }
        CODES
            .iter()
            .find(|(err, _)| *err == self)
            .map(|&(_, code)| code)
            .unwrap_or(libc::EINVAL)
    }

    /// Error for a non-zero status code.
    pub fn from_code(code: c_int) -> Self {
        CODES
            .iter()
            .find(|&&(_, c)| c == code)
            .map(|&(err, _)| err)
            .unwrap_or(Self::Other(code))
    }

    /// Translate a status code returned by a backend.
    pub fn status(code: c_int) -> KrwResult<()> {
        match code {
            0 => Ok(()),
            code => Err(Self::from_code(code)),
        }
    }

    /// Collapse a result back into a status code.
    pub fn to_status(result: KrwResult<()>) -> c_int {
        match result {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Operation not supported"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::DeviceError => write!(f, "Device error"),
            Self::Io => write!(f, "Input/output error (partial transfer)"),
            Self::OutOfMemory => write!(f, "Out of kernel memory"),
            Self::ProtocolTooOld => write!(f, "Handler protocol version too old"),
            Self::Incomplete => write!(f, "Backend left required handlers empty"),
            Self::Other(code) => write!(f, "Backend failure (status {})", code),
        }
    }
}

impl core::error::Error for Error {}
