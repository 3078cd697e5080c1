use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, X360Error>;

#[derive(Debug, Error)]
pub enum X360Error {
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Record too short: {what} needs {expected} bytes, got {actual}")]
    RecordLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Chain inconsistency: {0}")]
    ChainInconsistency(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl X360Error {
    /// Checks that `data` holds at least `expected` bytes before a fixed-size decode
    pub fn check_len(what: &'static str, data: &[u8], expected: usize) -> Result<()> {
        if data.len() < expected {
            return Err(X360Error::RecordLength {
                what,
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// The anomaly kind this error is recorded as when it is skipped rather than propagated
    pub fn anomaly_kind(&self) -> AnomalyKind {
        match self {
            X360Error::RecordLength { .. } => AnomalyKind::RecordLength,
            X360Error::Io(_) => AnomalyKind::Io,
            X360Error::FormatMismatch(_) => AnomalyKind::FormatMismatch,
            _ => AnomalyKind::ChainInconsistency,
        }
    }
}

/// What went wrong with a single skipped file or record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnomalyKind {
    FormatMismatch,
    RecordLength,
    ChainInconsistency,
    Io,
}

/// A per-entry problem that was recorded and skipped instead of aborting the scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    /// Path, slot index or other locator of the damaged entry
    pub location: String,
    pub detail: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, location: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            detail: detail.into(),
        }
    }

    pub fn from_error(location: impl Into<String>, error: &X360Error) -> Self {
        Self::new(error.anomaly_kind(), location, error.to_string())
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.kind, self.location, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(X360Error::check_len("record", &[0u8; 64], 64).is_ok());
        match X360Error::check_len("record", &[0u8; 10], 64) {
            Err(X360Error::RecordLength { expected, actual, .. }) => {
                assert_eq!(expected, 64);
                assert_eq!(actual, 10);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_anomaly_from_error() {
        let err = X360Error::ChainInconsistency("cycle at slot 3".to_string());
        let anomaly = Anomaly::from_error("/a/b", &err);
        assert_eq!(anomaly.kind, AnomalyKind::ChainInconsistency);
        assert_eq!(anomaly.location, "/a/b");
        assert!(anomaly.detail.contains("cycle at slot 3"));
    }
}
