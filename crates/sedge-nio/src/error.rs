//! Error types for the socket I/O layer.

use core::fmt;

/// Result type for multiplexer operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors from a readiness multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The handle is already registered with this multiplexer.
    AlreadyRegistered,

    /// The handle is not registered with this multiplexer.
    NotRegistered,

    /// Platform-specific error (raw OS errno).
    Os(i32),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::AlreadyRegistered => write!(f, "handle already registered"),
            SourceError::NotRegistered => write!(f, "handle not registered"),
            SourceError::Os(errno) => write!(f, "OS error: errno {}", errno),
        }
    }
}

impl std::error::Error for SourceError {}

/// Errors from stage lifecycle operations.
#[derive(Debug)]
pub enum StageError {
    /// Stages are permanent for the process lifetime; deregistering one
    /// is a programming error and always fails.
    DeregisterUnsupported,

    /// Stage configuration failed validation.
    Config(&'static str),

    /// Failed to spawn the stage's worker thread.
    SpawnFailed(std::io::Error),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::DeregisterUnsupported => {
                write!(f, "stage deregistration not supported")
            }
            StageError::Config(msg) => write!(f, "invalid stage config: {}", msg),
            StageError::SpawnFailed(e) => write!(f, "failed to spawn stage worker: {}", e),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StageError::SpawnFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from the connection write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The socket failed during a write; the connection has been closed.
    SinkClosed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::SinkClosed => write!(f, "connection closed during write"),
        }
    }
}

impl std::error::Error for WriteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", SourceError::AlreadyRegistered),
            "handle already registered"
        );
        assert_eq!(format!("{}", SourceError::Os(9)), "OS error: errno 9");
        assert_eq!(
            format!("{}", StageError::DeregisterUnsupported),
            "stage deregistration not supported"
        );
        assert_eq!(
            format!("{}", WriteError::SinkClosed),
            "connection closed during write"
        );
    }
}
