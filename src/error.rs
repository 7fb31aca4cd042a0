use std::io;
use thiserror::Error;

use crate::api::EndpointFamily;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("SLACK_TOKEN environment variable not set")]
    MissingToken,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid date format: {0}")]
    InvalidDate(String),

    #[error("Slack API error: {0}")]
    SlackApi(String),

    #[error("workspace directory warm-up failed: {0}")]
    DirectoryWarmup(#[source] FetchError),

    #[error("no conversation matches the selection: {0}")]
    UnknownConversation(String),

    #[error("export cancelled")]
    Cancelled,

    #[error("failed to read file at {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file at {path}: {source}")]
    WriteFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON serialization error: {0}")]
    JsonSerialize(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Why an unrecoverable response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnrecoverableKind {
    Authorization,
    NotFound,
    Other,
}

impl std::fmt::Display for UnrecoverableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnrecoverableKind::Authorization => f.write_str("authorization"),
            UnrecoverableKind::NotFound => f.write_str("not found"),
            UnrecoverableKind::Other => f.write_str("rejected"),
        }
    }
}

/// Failure of a single logical request after the gate gave up on it.
///
/// These stay scoped to one conversation: the coordinator records them in
/// the outcome map instead of aborting the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("{family} failed after {attempts} attempts: {message}")]
    Transient {
        family: EndpointFamily,
        attempts: u32,
        message: String,
    },

    #[error("{family} refused ({kind}): {message}")]
    Unrecoverable {
        family: EndpointFamily,
        kind: UnrecoverableKind,
        message: String,
    },

    #[error("{family} cancelled before completion")]
    Cancelled { family: EndpointFamily },
}

impl FetchError {
    pub fn family(&self) -> EndpointFamily {
        match self {
            FetchError::Transient { family, .. }
            | FetchError::Unrecoverable { family, .. }
            | FetchError::Cancelled { family } => *family,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, FetchError::Unrecoverable { .. })
    }

    /// Short label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Transient { .. } => "TransientFailure",
            FetchError::Unrecoverable { .. } => "Unrecoverable",
            FetchError::Cancelled { .. } => "Cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_missing_token_display() {
        let err = AppError::MissingToken;
        assert_eq!(err.to_string(), "SLACK_TOKEN environment variable not set");
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: AppError = io_err.into();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn test_read_file_display_and_source() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = AppError::ReadFile {
            path: "/cache/T1/channels.json".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("/cache/T1/channels.json"));
        assert!(err.to_string().contains("failed to read file"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_directory_warmup_keeps_fetch_error_as_source() {
        let err = AppError::DirectoryWarmup(FetchError::Unrecoverable {
            family: EndpointFamily::UsersList,
            kind: UnrecoverableKind::Authorization,
            message: "invalid_auth".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "workspace directory warm-up failed: users.list refused (authorization): invalid_auth"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transient_display() {
        let err = FetchError::Transient {
            family: EndpointFamily::History,
            attempts: 6,
            message: "connection reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "conversations.history failed after 6 attempts: connection reset"
        );
        assert_eq!(err.label(), "TransientFailure");
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn test_fetch_error_family() {
        let err = FetchError::Cancelled {
            family: EndpointFamily::Replies,
        };
        assert_eq!(err.family(), EndpointFamily::Replies);
        assert_eq!(err.label(), "Cancelled");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AppError>();
        assert_send_sync::<FetchError>();
    }
}
