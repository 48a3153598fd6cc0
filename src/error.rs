//! Status codes returned across the OCR public API and the internal
//! satisfy/register/acquire/release state machines.
//!
//! Mirrors the taxonomy in the original runtime's `ocr-errors.h`: a small,
//! flat set of codes rather than a tree of error types, because callers
//! (including cross-PD message handlers) need to carry a `u8`-sized
//! `returnDetail` alongside a response message.

use core::fmt;

/// A user-facing or internal status code.
///
/// `Busy` and `Pending` are not failures — they are part of the normal
/// control flow for datablock acquisition and asynchronous message
/// completion (spec-of-record: "transient is not an error"). Callers that
/// only care about hard failures should match on those two variants
/// separately from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrError {
    /// Invalid argument (bad slot index, bad kind, zero channel capacity).
    Einval,
    /// Allocation failure (strand node, waiter spill, datablock backing
    /// memory, GUID table growth).
    Enomem,
    /// The datablock is not available for immediate acquisition; the
    /// requester has been enqueued and will be woken asynchronously.
    Ebusy,
    /// The object has been (or is being) destroyed; access denied.
    Eacces,
    /// Operation not permitted in the current state (double free, double
    /// release, double satisfy of a non-persistent event).
    Eperm,
    /// A labeled GUID already exists.
    Eguidexists,
    /// The runtime is shutting down; the operation was canceled.
    Ecanceled,
    /// Operation unsupported for this object kind.
    Enosys,
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OcrError::Einval => "EINVAL",
            OcrError::Enomem => "ENOMEM",
            OcrError::Ebusy => "EBUSY",
            OcrError::Eacces => "EACCES",
            OcrError::Eperm => "EPERM",
            OcrError::Eguidexists => "EGUIDEXISTS",
            OcrError::Ecanceled => "ECANCELED",
            OcrError::Enosys => "ENOSYS",
        };
        f.write_str(s)
    }
}

impl std::error::Error for OcrError {}

pub type OcrResult<T> = Result<T, OcrError>;

/// Outcome of a datablock acquire attempt: success carries the resolved
/// pointer-equivalent (a `Guid` is enough in this in-memory model since the
/// "pointer" a DB hands out is just access to its backing buffer), `Busy`
/// means the requester was enqueued as a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome<T> {
    Acquired(T),
    Busy,
}
