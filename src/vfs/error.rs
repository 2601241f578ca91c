//! Filesystem error surface, mirrored onto std::io::ErrorKind so handles can
//! sit under std-io-speaking servers.

use std::fmt;
use std::io::ErrorKind;
use thiserror::Error;

/// Optional path context rendered as `": <path>"`.
#[derive(Debug, Clone)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

#[allow(dead_code)]
#[derive(Error, Debug)]
pub enum FsError {
    #[error("file does not exist{path}")]
    NotFound { path: PathHint },

    #[error("file exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("directory not empty{path}")]
    DirectoryNotEmpty { path: PathHint },

    #[error("invalid operation")]
    InvalidOperation,

    #[error("read-only file")]
    ReadOnlyFile,

    #[error("file is write-only")]
    WriteOnlyFile,

    #[error("cannot seek to negative offset")]
    NegativeOffset,

    #[error("O_SYNC flag is not supported")]
    SyncNotSupported,

    // Reserved: mode bits are recorded but not yet enforced.
    #[error("permission denied{path}")]
    PermissionDenied { path: PathHint },

    #[error("invalid flags {flags:#x}")]
    InvalidFlags { flags: u32 },

    #[error("line {line}: {msg}")]
    ManifestParse { line: usize, msg: String },

    #[error("blob i/o: {0}")]
    BlobIo(#[source] anyhow::Error),
}

impl From<FsError> for std::io::Error {
    fn from(value: FsError) -> Self {
        let kind = match value {
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FsError::NotADirectory { .. } => ErrorKind::NotADirectory,
            FsError::DirectoryNotEmpty { .. } => ErrorKind::DirectoryNotEmpty,
            FsError::InvalidOperation => ErrorKind::InvalidInput,
            FsError::ReadOnlyFile | FsError::WriteOnlyFile => ErrorKind::PermissionDenied,
            FsError::NegativeOffset => ErrorKind::InvalidInput,
            FsError::SyncNotSupported => ErrorKind::Unsupported,
            FsError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            FsError::InvalidFlags { .. } => ErrorKind::InvalidInput,
            FsError::ManifestParse { .. } => ErrorKind::InvalidData,
            FsError::BlobIo(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_hint_display() {
        assert_eq!(
            FsError::NotFound {
                path: PathHint::some("/a/b")
            }
            .to_string(),
            "file does not exist: /a/b"
        );
        assert_eq!(
            FsError::NotFound {
                path: PathHint::none()
            }
            .to_string(),
            "file does not exist"
        );
    }

    #[test]
    fn test_io_error_kinds() {
        let err: std::io::Error = FsError::SyncNotSupported.into();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err: std::io::Error = FsError::NotFound {
            path: PathHint::none(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
