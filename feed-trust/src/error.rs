// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {chrono::{DateTime, Utc}, implementation_store::StoreError, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("signature error: {0}")]
    Signature(#[from] feed_signature::SignatureError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("XML read error: {0}")]
    XmlRead(#[from] xml::reader::Error),

    #[error("XML write error: {0}")]
    XmlWrite(#[from] xml::writer::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP client error: {0:?}")]
    HttpClient(#[from] reqwest::Error),

    #[error("error persisting temporary file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("error downloading {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("unable to obtain key {key_id}: {source}")]
    KeyDownload {
        key_id: String,
        #[source]
        source: Box<FeedError>,
    },

    #[error("operation not valid for {0}")]
    InvalidOperation(String),

    #[error("not a valid feed URI: {0}")]
    InvalidFeedUri(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("feed {0} is not cached and network use is offline")]
    NotCachedOffline(String),

    #[error("feed {0} is not in the cache")]
    FeedNotCached(String),

    #[error("feed downloaded from {0} does not declare its URI")]
    FeedUriMissing(String),

    #[error("feed declares URI {actual} but was fetched from {expected}")]
    FeedUriMismatch { expected: String, actual: String },

    #[error("no trusted signatures on {0}")]
    NoTrustedSignatures(String),

    #[error("replay attack on {uri}: cached signature from {old} is newer than {new}")]
    ReplayAttack {
        uri: String,
        old: DateTime<Utc>,
        new: DateTime<Utc>,
    },

    #[error("invalid feed document: {0}")]
    InvalidFeed(String),

    #[error("invalid catalog document: {0}")]
    InvalidCatalog(String),

    #[error("invalid trust database: {0}")]
    InvalidTrustDb(String),

    #[error("unable to resolve user directories")]
    NoUserDirectories,
}

impl FeedError {
    /// Whether this error is due to the operation being cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Store(StoreError::Cancelled))
    }

    /// Whether this error is a network failure eligible for mirror fallback.
    pub fn is_download(&self) -> bool {
        matches!(self, Self::Download { .. })
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, FeedError>;
