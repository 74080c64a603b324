// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("signature block does not start on a new line")]
    MissingNewline,

    #[error("signature block does not end with the expected comment terminator")]
    InvalidEnd,

    #[error("signature block is not valid Base64: {0:?}")]
    NotBase64(#[from] base64::DecodeError),

    #[error("document already contains a signature block")]
    AlreadySigned,

    #[error("key data contains no public key")]
    NoPublicKey,
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, SignatureError>;
