use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
///
/// Transaction outcomes (`TxConflict`, `TxLock`, `TxDeadlock`,
/// `TxRollback`) are expected and user-retryable; they are surfaced as
/// errors so that `?` short-circuits the enclosing operation, but the
/// embedding layer is expected to match on them rather than abort.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Memory quota exhausted and no progress possible.
    QuotaExceeded(usize),
    /// Checksum mismatch at a known file offset.
    ChecksumMismatch { path: String, offset: u64 },
    /// Structural corruption of an on-disk region.
    Corruption { path: String, detail: String },
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    /// Write-write conflict detected at prepare time; caller must roll back.
    TxConflict,
    /// A predecessor version is still pending; caller should retry after backoff.
    TxLock,
    /// Cyclic wait-for dependency; one side of the cycle must abort.
    TxDeadlock,
    /// Operation attempted on a rolled-back or finished transaction.
    TxRollback,
    /// Bad path, scheme, or option combination; index open fails cleanly.
    Config(String),
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::QuotaExceeded(n) => write!(f, "Memory quota exceeded: {} bytes requested", n),
            Error::ChecksumMismatch { path, offset } => {
                write!(f, "Checksum mismatch in {} at offset {}", path, offset)
            }
            Error::Corruption { path, detail } => write!(f, "Corruption in {}: {}", path, detail),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::TxConflict => write!(f, "Transaction conflict"),
            Error::TxLock => write!(f, "Transaction must wait on a pending writer"),
            Error::TxDeadlock => write!(f, "Transaction deadlock detected"),
            Error::TxRollback => write!(f, "Transaction was rolled back"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// True for the expected, user-retryable transaction outcomes.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            Error::TxConflict | Error::TxLock | Error::TxDeadlock | Error::TxRollback
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_classification() {
        assert!(Error::TxConflict.is_transactional());
        assert!(Error::TxLock.is_transactional());
        assert!(Error::TxDeadlock.is_transactional());
        assert!(!Error::QuotaExceeded(42).is_transactional());
        assert!(!Error::Config("bad".into()).is_transactional());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::ChecksumMismatch {
            path: "db/0001-0002.index".into(),
            offset: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("db/0001-0002.index"));
        assert!(msg.contains("4096"));
    }
}
