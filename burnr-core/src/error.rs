//! Error taxonomy for burn runs.
//!
//! Collaborators report failures as [`anyhow::Error`]. The pipeline maps each of
//! them to exactly one [`ErrorInfo`], tagged with the [`ErrorKind`] of the stage
//! that failed, before it crosses to the caller inside a notification.
//! [`BurnError`] covers the failures the controller itself can return before a
//! run exists.

use std::fmt;
use thiserror::Error;

/// Classifies what went wrong and where.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The staging directory could not be created or removed.
    StagingError,
    /// The image could not be downloaded or failed validation.
    FetchError,
    /// The device could not be made writable. The device is untouched.
    PrepareError,
    /// Burning failed part-way. The device may be unusable.
    WriteIncomplete,
    /// The device could not be ejected after a successful write.
    EjectAdvisory,
    /// Enumeration found no candidate devices.
    NoDevicesError,
    /// The caller cancelled the run at a stage boundary.
    Cancelled,
    /// The worker hit an unexpected fault, such as a panicking collaborator.
    Internal,
}

impl ErrorKind {
    /// Whether restarting the whole run is a reasonable response.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorKind::StagingError | ErrorKind::WriteIncomplete | ErrorKind::Internal
        )
    }

    /// Whether this kind can only ever be an advisory. It is not the test for
    /// membership in [`crate::RunOutcome::advisories`]: a `StagingError` from
    /// cleanup after a successful burn lands there too, while the same kind
    /// at run start is fatal.
    pub fn is_advisory(self) -> bool {
        matches!(self, ErrorKind::EjectAdvisory)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StagingError => "staging error",
            ErrorKind::FetchError => "download failed",
            ErrorKind::PrepareError => "device preparation failed",
            ErrorKind::WriteIncomplete => "write incomplete",
            ErrorKind::EjectAdvisory => "eject failed",
            ErrorKind::NoDevicesError => "no devices",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A failure as seen by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
        }
    }

    /// Maps a collaborator error, keeping its whole context chain in the message.
    pub fn from_error(kind: ErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Errors returned by [`crate::BurnController`] before any run is started.
#[derive(Error, Debug)]
pub enum BurnError {
    #[error("a burn is already in progress")]
    AlreadyRunning,

    #[error("no removable devices found")]
    NoDevices,

    #[error("device enumeration failed: {0}")]
    Catalog(ErrorInfo),

    #[error("failed to spawn burn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BurnError {
    /// The caller-facing [`ErrorInfo`] for conditions the taxonomy names.
    pub fn info(&self) -> Option<ErrorInfo> {
        match self {
            BurnError::NoDevices => Some(ErrorInfo::new(
                ErrorKind::NoDevicesError,
                "no candidate devices",
            )),
            BurnError::Catalog(info) => Some(info.clone()),
            _ => None,
        }
    }
}
