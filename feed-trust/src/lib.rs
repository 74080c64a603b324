// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verified acquisition of signed software feeds.

Feeds are XML documents describing software, published at HTTP(S) URLs and
signed with OpenPGP keys. This crate downloads feeds, checks their
signatures against a database of keys trusted per domain and stores them in
a local cache.

The main pieces are:

* [trust_db::TrustDb] records which key fingerprints are trusted for which
  domains. It is persisted as XML and modified under a cross-process lock.
* [trust_manager::TrustManager] finds a trusted signature on a document,
  downloading missing keys and asking a [handler::TaskHandler] about keys
  not seen before.
* [feed_manager::FeedManager] serves feeds from the
  [feed_cache::FeedCache], downloading them when missing or asked to refresh.
  Downloads fall back to a feed mirror and reject documents that claim a
  different URI or roll back to an older signature.
* [catalog::CatalogManager] maintains lists of known feeds.

All network access goes through the [fetch::Fetcher] trait.
[fetch::HttpFetcher] is the implementation backed by `reqwest`.
*/

pub mod catalog;
pub mod config;
pub mod error;
pub mod feed;
pub mod feed_cache;
pub mod feed_manager;
pub mod fetch;
pub mod handler;
pub mod key_info;
pub mod locations;
pub mod preferences;
pub mod trust_db;
pub mod trust_manager;
pub mod uri;

#[cfg(test)]
mod testutil;

pub use {
    error::{FeedError, Result},
    uri::FeedUri,
};
