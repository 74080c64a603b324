// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deterministic construction and storage of implementation directories.

An implementation is a directory tree identified by the digest of its
[manifest::Manifest]. This crate builds such trees from [recipe::Recipe]s
(archive extraction, single files, removals, renames and copies out of other
implementations), walks them in a platform independent order and keeps them
in a [store::DirectoryStore].

Filesystems that cannot record executable bits or symlinks get the
information recorded in [flags] files instead, so a tree has the same
digest wherever it is stored.
*/

pub mod archive;
pub mod builder;
pub mod cancel;
pub mod clone;
pub mod error;
pub mod flags;
pub mod lock;
pub mod manifest;
pub mod path;
pub mod recipe;
pub mod store;
pub mod walker;

pub use {
    cancel::CancellationToken,
    error::{Result, StoreError},
    lock::FileLock,
    manifest::ManifestDigest,
};
