// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem locations of persistent state. */

use {
    crate::{FeedError, Result},
    std::path::{Path, PathBuf},
};

const APP_DIR: &str = "0install.net";

/// Configuration and cache roots for one user.
#[derive(Clone, Debug)]
pub struct Locations {
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Locations {
    pub fn new(config_dir: impl AsRef<Path>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    /// Resolve locations from the platform's per-user directories.
    pub fn from_user_dirs() -> Result<Self> {
        let config = dirs::config_dir().ok_or(FeedError::NoUserDirectories)?;
        let cache = dirs::cache_dir().ok_or(FeedError::NoUserDirectories)?;

        Ok(Self::new(config.join(APP_DIR), cache.join(APP_DIR)))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("injector").join("global.toml")
    }

    pub fn trust_db(&self) -> PathBuf {
        self.config_dir.join("injector").join("trustdb.xml")
    }

    /// Directory holding per-feed preferences.
    pub fn feed_preferences_dir(&self) -> PathBuf {
        self.config_dir.join("injector").join("feeds")
    }

    pub fn catalog_sources(&self) -> PathBuf {
        self.config_dir.join("injector").join("catalog-sources")
    }

    pub fn keyring_dir(&self) -> PathBuf {
        self.config_dir.join("injector").join("keyring")
    }

    /// Directory holding cached feed documents.
    pub fn feed_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("interfaces")
    }

    pub fn last_check_attempt_dir(&self) -> PathBuf {
        self.cache_dir.join("injector").join("last-check-attempt")
    }

    pub fn catalog_cache(&self) -> PathBuf {
        self.cache_dir.join("catalog.xml")
    }

    pub fn implementation_store_dir(&self) -> PathBuf {
        self.cache_dir.join("implementations")
    }
}
