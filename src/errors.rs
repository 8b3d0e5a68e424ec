// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the scan engine

use crate::backends::capture::types::BackendError;
use crate::normalize::RejectionReason;
use std::fmt;
use std::time::Duration;

/// Result type alias using ScanError
pub type ScanResult<T> = Result<T, ScanError>;

/// Hardware capabilities that a camera track may or may not advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Torch / flashlight LED
    Torch,
    /// Manual focus mode
    ManualFocus,
}

/// Main error type for scan sessions
#[derive(Debug, Clone)]
pub enum ScanError {
    /// The camera could not be opened: permission denied, device missing,
    /// hardware busy, or every constraint tier rejected
    CameraUnavailable(BackendError),
    /// The decode render surface never reached a non-zero size within the
    /// bounded retry budget
    ScannerSurfaceUnready { attempts: u32 },
    /// The stream never delivered a first frame within the ready window
    VideoReadyTimeout { waited: Duration },
    /// The active track does not advertise the requested capability
    CapabilityUnsupported(Capability),
    /// A claimed detection failed normalization; the session keeps scanning
    DecodeRejected(RejectionReason),
    /// Configuration errors
    Config(String),
    /// Generic error with message
    Other(String),
}

impl ScanError {
    /// Whether this error ends the session.
    ///
    /// Fatal errors leave the session in `Idle` with the camera released;
    /// non-fatal errors are surfaced as advisories while scanning continues.
    pub fn is_fatal(&self) -> bool {
        match self {
            ScanError::CameraUnavailable(_)
            | ScanError::ScannerSurfaceUnready { .. }
            | ScanError::VideoReadyTimeout { .. }
            | ScanError::Config(_)
            | ScanError::Other(_) => true,
            ScanError::CapabilityUnsupported(_) | ScanError::DecodeRejected(_) => false,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Torch => write!(f, "torch"),
            Capability::ManualFocus => write!(f, "manual focus"),
        }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::CameraUnavailable(reason) => {
                write!(f, "Camera unavailable: {}", reason)
            }
            ScanError::ScannerSurfaceUnready { attempts } => {
                write!(
                    f,
                    "Scanner surface never became ready after {} attempts",
                    attempts
                )
            }
            ScanError::VideoReadyTimeout { waited } => {
                write!(
                    f,
                    "Camera produced no frames within {}s; check camera permissions and that no other application is using the device",
                    waited.as_secs()
                )
            }
            ScanError::CapabilityUnsupported(cap) => {
                write!(f, "This camera does not support {}", cap)
            }
            ScanError::DecodeRejected(reason) => write!(f, "{}", reason),
            ScanError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ScanError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<RejectionReason> for ScanError {
    fn from(reason: RejectionReason) -> Self {
        ScanError::DecodeRejected(reason)
    }
}

impl From<String> for ScanError {
    fn from(msg: String) -> Self {
        ScanError::Other(msg)
    }
}

impl From<&str> for ScanError {
    fn from(msg: &str) -> Self {
        ScanError::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(ScanError::CameraUnavailable(BackendError::Busy).is_fatal());
        assert!(ScanError::ScannerSurfaceUnready { attempts: 10 }.is_fatal());
        assert!(
            ScanError::VideoReadyTimeout {
                waited: Duration::from_secs(15)
            }
            .is_fatal()
        );
        assert!(!ScanError::CapabilityUnsupported(Capability::Torch).is_fatal());
    }

    #[test]
    fn timeout_message_mentions_permissions() {
        let err = ScanError::VideoReadyTimeout {
            waited: Duration::from_secs(15),
        };
        assert!(err.to_string().contains("permissions"));
    }
}
