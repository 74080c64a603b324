// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("zip error: {0:?}")]
    Zip(#[from] zip::result::ZipError),

    #[error("temporary file persist error: {0:?}")]
    Persist(#[from] tempfile::PersistError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("path escapes the target directory: {0}")]
    PathBreakout(String),

    #[error("{0} requires a non-empty path")]
    EmptyPath(&'static str),

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(String),

    #[error("unknown recipe step: {0}")]
    UnknownRecipeStep(String),

    #[error("recipe step {0} has no matching downloaded file")]
    RecipeFileNotDownloaded(String),

    #[error("archive {0} has no MIME type")]
    UnknownArchiveType(String),

    #[error("unsupported archive MIME type: {0}")]
    UnsupportedArchiveType(String),

    #[error("archive start offset {0} is past the end of the file")]
    ArchiveOffsetOutOfRange(u64),

    #[error("single file {0} has no destination")]
    FileMissingDestination(String),

    #[error("copy-from step refers to an implementation that was not resolved")]
    NotResolved,

    #[error("copy-from source {0} does not exist in implementation {1}")]
    CopyFromSourceMissing(String, String),

    #[error("copy-from of file {0} requires a destination")]
    CopyFromDestinationMissing(String),

    #[error("implementation {0} is not in the store")]
    ImplementationNotFound(String),

    #[error("implementation {0} is already in the store")]
    ImplementationAlreadyInStore(String),

    #[error("digest mismatch: expected {expected}; got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unknown manifest format: {0}")]
    UnknownManifestFormat(String),

    #[error("malformed manifest digest: {0}")]
    BadManifestDigest(String),

    #[error("symlink target of {0} is not valid UTF-8")]
    SymlinkTargetNotUtf8(String),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
