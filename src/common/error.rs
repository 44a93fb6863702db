use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Compact code stored in the catalog's sticky error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    FileNotFound,
    AccessDenied,
    IsDirectory,
    MalformedPath,
    PathIo,
    NotDicom,
    UnreadableFile,
    MissingPixelData,
    DirectoryIndex,
    Database,
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),
    #[error("Permission denied: {0}")]
    AccessDenied(PathBuf),
    #[error("Is a directory: {0}")]
    IsDirectory(PathBuf),
    #[error("Malformed path: {0}")]
    Malformed(PathBuf),
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

impl PathError {
    /// Classify an I/O failure on `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => PathError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => PathError::AccessDenied(path.to_path_buf()),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                PathError::Malformed(path.to_path_buf())
            }
            _ => PathError::Io(path.to_path_buf(), err),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PathError::NotFound(_) => ErrorCode::FileNotFound,
            PathError::AccessDenied(_) => ErrorCode::AccessDenied,
            PathError::IsDirectory(_) => ErrorCode::IsDirectory,
            PathError::Malformed(_) => ErrorCode::MalformedPath,
            PathError::Io(..) => ErrorCode::PathIo,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            PathError::NotFound(p)
            | PathError::AccessDenied(p)
            | PathError::IsDirectory(p)
            | PathError::Malformed(p)
            | PathError::Io(p, _) => p,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Not a DICOM file: {0}")]
    NotDicom(PathBuf),
    #[error("Failed to read DICOM file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: dicom_object::ReadError,
    },
    #[error("Malformed DICOM file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("No pixel data in {0}")]
    MissingPixelData(PathBuf),
}

impl DecodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::NotDicom(_) => ErrorCode::NotDicom,
            DecodeError::Unreadable { .. } | DecodeError::Malformed { .. } => {
                ErrorCode::UnreadableFile
            }
            DecodeError::MissingPixelData(_) => ErrorCode::MissingPixelData,
        }
    }
}

/// Structural failure of the directory-index byte stream.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("missing DICM signature")]
    NoSignature,
    #[error("unsupported transfer syntax {0}")]
    TransferSyntax(String),
    #[error("truncated at byte {0}")]
    Truncated(usize),
    #[error("unexpected tag ({0:04X},{1:04X}) at byte {2}")]
    UnexpectedTag(u16, u16, usize),
    #[error("no directory record sequence")]
    NoRecords,
    #[error("root record offset {0} does not refer to a record")]
    BadRootOffset(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Directory index {path} is malformed: {source}")]
    DirectoryIndex {
        path: PathBuf,
        #[source]
        source: IndexError,
    },
    #[error("Cannot read directory index {0}: {1}")]
    DirectoryIndexIo(PathBuf, #[source] io::Error),
    #[error("Database {path} does not match the expected schema: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Database {path} has no {table} table")]
    MissingTable { path: PathBuf, table: &'static str },
}

impl SchemaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SchemaError::DirectoryIndex { .. } | SchemaError::DirectoryIndexIo(..) => {
                ErrorCode::DirectoryIndex
            }
            SchemaError::Database { .. } | SchemaError::MissingTable { .. } => ErrorCode::Database,
        }
    }
}

/// Errors that abort a whole scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Scan root unusable: {0}")]
    Root(#[from] PathError),
    #[error("Invalid file name pattern: {0}")]
    Pattern(#[from] globset::Error),
    #[error("Catalog invariant violated: {0}")]
    Logic(String),
}
