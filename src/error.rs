//! Error taxonomy shared by the catalog builder and the export coordinator

use serde::Serialize;

/// Coarse error category, stable across releases so callers can branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Format,
    File,
    Canceled,
    Unknown,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Manifest or file fetch failed (connect error or non-success status)
    #[error("network error: {0}")]
    Network(String),

    /// Manifest missing or unparseable after fetch
    #[error("format error: {0}")]
    Format(String),

    /// Local read/write or transport failure
    #[error("file error: {0}")]
    File(String),

    /// Cooperative cancellation, not a fault
    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    Unknown(String),
}

impl SyncError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn file(msg: impl Into<String>) -> Self {
        Self::File(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Format(_) => ErrorKind::Format,
            Self::File(_) => ErrorKind::File,
            Self::Canceled => ErrorKind::Canceled,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::File(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for SyncError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Format(e.to_string())
    }
}

/// Terminal result of a catalog update or an export run
#[derive(Debug, Clone)]
pub enum RunOutcome<T> {
    Ok(T),
    Canceled,
    Failed(SyncError),
}

impl<T> RunOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl<T> From<Result<T, SyncError>> for RunOutcome<T> {
    fn from(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(SyncError::Canceled) => Self::Canceled,
            Err(e) => Self::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_routes_to_canceled_outcome() {
        let outcome: RunOutcome<()> = Err(SyncError::Canceled).into();
        assert!(outcome.is_canceled());
        assert!(outcome.error().is_none());

        let outcome: RunOutcome<()> = Err(SyncError::file("disk full")).into();
        assert_eq!(outcome.error().map(|e| e.kind()), Some(ErrorKind::File));
    }
}
