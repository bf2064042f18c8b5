//! Error types for mapkv operations
//!
//! All mapkv errors are represented by the KvError enum. A missing key is
//! never an error: lookups return `Option`/`ReadStatus` instead.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// mapkv error types with detailed context
#[derive(Debug, Clone)]
pub enum KvError {
    /// A required argument was empty or malformed; nothing was changed
    InvalidArgument {
        /// Name of the offending argument
        argument: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// I/O operation on the container failed (storage unavailable)
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A record failed validation while decoding
    CorruptRecord {
        /// Byte offset of the record inside the container
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Container header is unreadable and cannot be recovered
    CorruptHeader {
        /// Container file
        path: PathBuf,
        /// Description of the problem
        reason: String,
    },

    /// Container was written by a newer format version
    UnsupportedVersion {
        /// Container file
        path: PathBuf,
        /// Version found in the header
        found: u32,
        /// Highest version this build understands
        supported: u32,
    },

    /// Entry size exceeds maximum allowed
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },

    /// Inter-process file lock could not be acquired or released
    Lock {
        /// Locked container file
        path: PathBuf,
        /// OS error description
        message: String,
    },

    /// Configuration rejected by `Config::validate`
    InvalidConfig(String),
}

impl KvError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error, context: &str) -> Self {
        KvError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    pub(crate) fn invalid(argument: &'static str, reason: impl Into<String>) -> Self {
        KvError::InvalidArgument { argument, reason: reason.into() }
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::InvalidArgument { argument, reason } => {
                write!(f, "Invalid argument `{}`: {}", argument, reason)
            }

            KvError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            KvError::CorruptRecord { offset, reason } => {
                write!(f, "Corrupt record at offset {}: {}", offset, reason)
            }

            KvError::CorruptHeader { path, reason } => {
                write!(f, "Corrupt container header in {}: {}", path.display(), reason)
            }

            KvError::UnsupportedVersion { path, found, supported } => {
                write!(f, "Container {} has format version {}, newest supported is {}",
                       path.display(), found, supported)
            }

            KvError::OversizedEntry { entry_size, max_size, component } => {
                write!(f, "Entry {} too large: {} bytes exceeds limit of {} bytes",
                       component, entry_size, max_size)
            }

            KvError::Lock { path, message } => {
                write!(f, "File lock on {} failed: {}", path.display(), message)
            }

            KvError::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl Error for KvError {}

/// Convert std::io::Error to KvError::Io
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for mapkv operations
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::UnsupportedVersion {
            path: PathBuf::from("/tmp/settings"),
            found: 9,
            supported: 1,
        };

        let display = format!("{}", err);
        assert!(display.contains("/tmp/settings"));
        assert!(display.contains("version 9"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let kv_err: KvError = io_err.into();

        match kv_err {
            KvError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_helper_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = KvError::io(std::path::Path::new("/data/kv"), io_err, "Failed to grow container");
        let display = err.to_string();
        assert!(display.contains("/data/kv"));
        assert!(display.contains("Failed to grow container"));
    }
}
