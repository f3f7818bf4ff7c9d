//! Error types.
//!
//! The engine reports I/O failures through distilled results (see
//! [`crate::result`]), not through `Result` returns: completion runs in
//! whatever backend reaps the I/O and cannot construct issuer-facing errors.
//! The types here cover the remaining surfaces: configuration rejection,
//! read-stream setup, and the user-visible error reconstructed from a
//! distilled result by a callback's error hook. API violations (double
//! acquire, foreign release) are panics and abort the offending backend
//! thread only.

use std::fmt;
use std::io;

/// Rejected engine configuration.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A knob that must be positive was zero.
    Zero(&'static str),
    /// A knob exceeds its hard ceiling.
    TooLarge {
        name: &'static str,
        value: u64,
        max: u64,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero(name) => write!(f, "{name} must be greater than zero"),
            Self::TooLarge { name, value, max } => {
                write!(f, "{name} too large: {value} (max: {max})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Read-stream setup failures.
#[derive(Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// I/O error from the block source while opening the stream.
    Io(io::Error),
    /// The pin budget cannot hold even a single buffer.
    PinBudgetTooSmall,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::PinBudgetTooSmall => write!(f, "pin budget admits no buffers"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// User-visible I/O failure, reconstructed from a distilled result by the
/// error hook of the callback that produced it.
#[derive(Debug)]
pub struct IoFailure {
    /// Human-readable description assembled by the error hook.
    pub message: String,
    /// Operating-system error, when the failure originated there.
    pub errno: Option<i32>,
}

impl IoFailure {
    pub fn new(message: String) -> Self {
        Self {
            message,
            errno: None,
        }
    }

    pub fn with_errno(message: String, errno: i32) -> Self {
        Self {
            message,
            errno: Some(errno),
        }
    }
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(
                f,
                "{}: {}",
                self.message,
                io::Error::from_raw_os_error(errno)
            ),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for IoFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::TooLarge {
            name: "buffer_io_size",
            value: 512,
            max: 128,
        };
        let msg = format!("{err}");
        assert!(msg.contains("512"));
        assert!(msg.contains("128"));
    }

    #[test]
    fn io_failure_appends_errno_text() {
        let err = IoFailure::with_errno("could not read block 7".into(), libc::EIO);
        let msg = format!("{err}");
        assert!(msg.contains("block 7"));
        assert!(msg.len() > "could not read block 7: ".len());
    }
}
