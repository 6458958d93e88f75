use std::io;
use thiserror::Error;

/// Result of a scanning operation.
pub type ScanResult<T> = Result<T, ScanError>;

/// A scanning error.
///
/// Probe timeouts are deliberately absent: a timeout is an expected outcome
/// encoded as [`crate::scanning::ProbeOutcome::Timeout`].  `Socket` is the
/// only unrecoverable kind and triggers the process-wide emergency stop.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Kernel-level failure on send or receive (socket exhaustion,
    /// permission, network down).
    #[error("socket failure: {0}")]
    Socket(#[from] io::Error),
    /// A received packet was too short or otherwise unparseable.
    #[error("malformed packet")]
    MalformedPacket,
    /// The ICMP identifier or sequence bounds given to a prober are empty
    /// or inverted.
    #[error("invalid probe identifier bounds")]
    InvalidProbeBounds,
}

impl ScanError {
    /// Whether the error is unrecoverable and must raise the emergency stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Socket(_))
    }
}
