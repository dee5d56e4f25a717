use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// One of the three data blocks carried by a patch container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Control,
    Diff,
    Extra,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Block::Control => "control",
            Block::Diff => "diff",
            Block::Extra => "extra",
        })
    }
}

/// A patch was rejected as corrupt. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("patch is {len} bytes, shorter than the {header}-byte header")]
    TooShort { len: usize, header: usize },

    #[error("bad patch magic {found:02x?}")]
    BadMagic { found: [u8; 8] },

    #[error("negative {block} block size {size}")]
    NegativeBlockSize { block: Block, size: i64 },

    #[error("negative output size {0}")]
    NegativeOutputSize(i64),

    #[error("patch declares at least {required} bytes but only {actual} are present")]
    SizeMismatch { required: u64, actual: u64 },

    #[error("{block} run of {length} bytes at output offset {new_pos} exceeds output size {new_len}")]
    RangeOverflow {
        block: Block,
        new_pos: u64,
        length: i64,
        new_len: u64,
    },

    #[error("seek moved old position to {old_pos}, past the {old_len}-byte original")]
    OldPositionOverflow { old_pos: i64, old_len: u64 },

    #[error("{block} block ended early")]
    Truncated { block: Block },

    #[error("failed to decompress {block} block: {message}")]
    Decompress { block: Block, message: String },

    #[error("{block} block decompresses past its {limit}-byte limit")]
    DecodedTooLarge { block: Block, limit: u64 },
}

/// Failure of a content store operation that must reach the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("permission denied: {}", .path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("directory missing for {}", .path.display())]
    DirectoryMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O failure on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid object hash {hash:?}: expected {expected_len} hex characters")]
    InvalidHash { hash: String, expected_len: usize },
}

impl StorageError {
    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied { path, source },
            io::ErrorKind::NotFound => StorageError::DirectoryMissing { path, source },
            _ => StorageError::Io { path, source },
        }
    }
}

/// Why an atomic replacement did not commit. The target has already been
/// rolled back by the time one of these is returned.
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("could not back up {} to {}", .target.display(), .backup.display())]
    BackupFailed {
        target: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} was still present {timeout:?} after deletion", .target.display())]
    DeleteTimeout { target: PathBuf, timeout: Duration },

    #[error("could not copy {} over {}", .source_path.display(), .target.display())]
    CopyToTargetFailed {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{cause}; restoring {} also failed, original kept at {}", .target.display(), .backup.display())]
    RollbackFailed {
        cause: Box<ReplaceError>,
        target: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure applying a patch file to an original file on disk.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl ApplyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ApplyError::Io {
            path: path.into(),
            source,
        }
    }
}
