// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! User configuration. */

use {
    crate::{FeedError, Result},
    chrono::Duration,
    serde::{Deserialize, Serialize},
    std::{io::Write, path::Path},
    url::Url,
};

pub const DEFAULT_FEED_MIRROR: &str = "http://roscidus.com/0mirror";
pub const DEFAULT_KEY_INFO_SERVER: &str = "https://keylookup.appspot.com/";
pub const DEFAULT_FRESHNESS_SECONDS: u64 = 7 * 24 * 60 * 60;

/// How much network access is permitted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkLevel {
    /// Never touch the network.
    Offline,
    /// Only download what is missing.
    Minimal,
    /// Also refresh stale feeds.
    Full,
}

impl Default for NetworkLevel {
    fn default() -> Self {
        Self::Full
    }
}

/// Settings controlling feed acquisition and trust decisions.
///
/// Empty URL strings disable the corresponding service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub network_use: NetworkLevel,
    /// Seconds after which a cached feed is considered stale.
    pub freshness: u64,
    /// Trust keys with a good vote for feeds seen for the first time.
    pub auto_approve_keys: bool,
    pub feed_mirror: String,
    pub key_info_server: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_use: NetworkLevel::default(),
            freshness: DEFAULT_FRESHNESS_SECONDS,
            auto_approve_keys: true,
            feed_mirror: DEFAULT_FEED_MIRROR.to_string(),
            key_info_server: DEFAULT_KEY_INFO_SERVER.to_string(),
        }
    }
}

fn optional_url(value: &str) -> Result<Option<Url>> {
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Url::parse(value)?))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(data) => Ok(toml::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(FeedError::IoPath(format!("{}", path.display()), e)),
        }
    }

    /// Write configuration to a TOML file, replacing it atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .ok_or_else(|| FeedError::InvalidOperation(format!("{}", path.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| FeedError::IoPath(format!("{}", parent.display()), e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(toml::to_string_pretty(self)?.as_bytes())?;
        temp.persist(path)?;

        Ok(())
    }

    /// The freshness period, saturating at the largest representable duration.
    pub fn freshness(&self) -> Duration {
        i64::try_from(self.freshness)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    pub fn feed_mirror(&self) -> Result<Option<Url>> {
        optional_url(&self.feed_mirror)
    }

    pub fn key_info_server(&self) -> Result<Option<Url>> {
        optional_url(&self.key_info_server)
    }
}
