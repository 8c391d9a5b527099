use std::fmt;

use thiserror::Error;

/// Failure classes the retry policy and the orchestrator reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Validation,
    Authentication,
    Authorization,
    Connection,
    Navigation,
    Export,
    Parse,
    Remote,
    Inbox,
    Config,
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Connection => "connection",
            ErrorClass::Navigation => "navigation",
            ErrorClass::Export => "export",
            ErrorClass::Parse => "parse",
            ErrorClass::Remote => "remote",
            ErrorClass::Inbox => "inbox",
            ErrorClass::Config => "config",
            ErrorClass::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid value: {0}")]
    Validation(String),

    /// The source portal rejected the login or its login form is missing.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The remote calendar store rejected our credentials.
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("malformed calendar document: {0}")]
    Parse(String),

    #[error("calendar store error: {0}")]
    Remote(String),

    #[error("inbox error: {0}")]
    Inbox(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::Authentication(_) => ErrorClass::Authentication,
            SyncError::Authorization(_) => ErrorClass::Authorization,
            SyncError::Connection(_) => ErrorClass::Connection,
            SyncError::Navigation(_) => ErrorClass::Navigation,
            SyncError::Export(_) => ErrorClass::Export,
            SyncError::Parse(_) => ErrorClass::Parse,
            SyncError::Remote(_) => ErrorClass::Remote,
            SyncError::Inbox(_) => ErrorClass::Inbox,
            SyncError::Config(_) => ErrorClass::Config,
            SyncError::Io(_) => ErrorClass::Io,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return SyncError::Connection(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                SyncError::Authorization(err.to_string())
            }
            Some(status) if status.is_server_error() => SyncError::Connection(err.to_string()),
            _ => SyncError::Remote(err.to_string()),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_follows_variant() {
        assert_eq!(
            SyncError::Connection("reset".to_string()).class(),
            ErrorClass::Connection
        );
        assert_eq!(
            SyncError::Authorization("401".to_string()).class(),
            ErrorClass::Authorization
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(SyncError::from(io).class(), ErrorClass::Io);
    }

    #[test]
    fn display_names_the_class() {
        let err = SyncError::Navigation("reached 2025-W39, wanted 2025-W38".to_string());
        assert_eq!(
            err.to_string(),
            "navigation failed: reached 2025-W39, wanted 2025-W38"
        );
        assert_eq!(ErrorClass::Export.to_string(), "export");
    }
}
