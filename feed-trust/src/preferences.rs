// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-feed bookkeeping: when a feed was last checked and last attempted. */

use {
    crate::{uri::FeedUri, FeedError, Result},
    chrono::{DateTime, TimeZone, Utc},
    filetime::FileTime,
    log::warn,
    serde::{Deserialize, Serialize},
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
};

/// Preferences stored for a feed.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FeedPreferences {
    /// Unix time of the last successful check for updates.
    pub last_checked: i64,
}

impl FeedPreferences {
    fn path(dir: &Path, uri: &FeedUri) -> PathBuf {
        dir.join(uri.pretty_escape())
    }

    /// Load preferences for a feed. A missing file yields defaults.
    pub fn load_for(dir: impl AsRef<Path>, uri: &FeedUri) -> Result<Self> {
        let path = Self::path(dir.as_ref(), uri);

        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(toml::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(FeedError::IoPath(format!("{}", path.display()), e)),
        }
    }

    /// Load preferences for a feed, falling back to defaults on any error.
    pub fn load_for_safe(dir: impl AsRef<Path>, uri: &FeedUri) -> Self {
        match Self::load_for(dir, uri) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!("unable to load preferences for {}: {}", uri, e);
                Self::default()
            }
        }
    }

    pub fn save_for(&self, dir: impl AsRef<Path>, uri: &FeedUri) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| FeedError::IoPath(format!("{}", dir.display()), e))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(toml::to_string_pretty(self)?.as_bytes())?;
        temp.persist(Self::path(dir, uri))?;

        Ok(())
    }

    /// When the feed was last checked. Unrepresentable values count as never.
    pub fn last_checked(&self) -> DateTime<Utc> {
        match Utc.timestamp_opt(self.last_checked, 0).single() {
            Some(time) => time,
            None => {
                warn!("ignoring out of range last-checked time {}", self.last_checked);
                DateTime::UNIX_EPOCH
            }
        }
    }

    pub fn set_last_checked(&mut self, time: DateTime<Utc>) {
        self.last_checked = time.timestamp();
    }
}

/// Zero-byte marker files whose modification time records download attempts.
#[derive(Clone, Debug)]
pub struct CheckAttempts {
    dir: PathBuf,
}

impl CheckAttempts {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, uri: &FeedUri) -> PathBuf {
        self.dir.join(uri.pretty_escape())
    }

    /// When a download of the feed was last attempted. Never means the epoch.
    pub fn get(&self, uri: &FeedUri) -> DateTime<Utc> {
        match std::fs::metadata(self.path(uri)).and_then(|m| m.modified()) {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(_) => DateTime::UNIX_EPOCH,
        }
    }

    /// Record an attempt at `time`.
    pub fn set(&self, uri: &FeedUri, time: DateTime<Utc>) -> Result<()> {
        let path = self.path(uri);
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| FeedError::IoPath(format!("{}", self.dir.display()), e))?;

        if !path.exists() {
            std::fs::File::create(&path)
                .map_err(|e| FeedError::IoPath(format!("{}", path.display()), e))?;
        }
        filetime::set_file_mtime(
            &path,
            FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos()),
        )
        .map_err(|e| FeedError::IoPath(format!("{}", path.display()), e))?;

        Ok(())
    }

    /// Record an attempt now.
    pub fn touch(&self, uri: &FeedUri) -> Result<()> {
        self.set(uri, Utc::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn preferences_round_trip() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let uri = FeedUri::parse("https://example.org/app.xml")?;

        let mut prefs = FeedPreferences::load_for(temp_dir.path(), &uri)?;
        assert_eq!(prefs.last_checked(), DateTime::UNIX_EPOCH);

        prefs.set_last_checked(at(1_600_000_000));
        prefs.save_for(temp_dir.path(), &uri)?;
        assert_eq!(
            FeedPreferences::load_for(temp_dir.path(), &uri)?.last_checked(),
            at(1_600_000_000)
        );

        std::fs::write(temp_dir.path().join(uri.pretty_escape()), "last-checked = [")?;
        assert!(FeedPreferences::load_for(temp_dir.path(), &uri).is_err());
        assert_eq!(
            FeedPreferences::load_for_safe(temp_dir.path(), &uri),
            FeedPreferences::default()
        );

        Ok(())
    }

    #[test]
    fn check_attempts() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let attempts = CheckAttempts::new(temp_dir.path().join("last-check-attempt"));
        let uri = FeedUri::parse("https://example.org/app.xml")?;

        assert_eq!(attempts.get(&uri), DateTime::UNIX_EPOCH);

        attempts.set(&uri, at(1_500_000_000))?;
        assert_eq!(attempts.get(&uri), at(1_500_000_000));
        let marker = temp_dir
            .path()
            .join("last-check-attempt")
            .join(uri.pretty_escape());
        assert_eq!(std::fs::metadata(marker)?.len(), 0);

        Ok(())
    }

    #[test]
    fn out_of_range_last_checked() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let uri = FeedUri::parse("https://example.org/app.xml")?;

        for value in [i64::MAX, i64::MIN] {
            std::fs::write(
                temp_dir.path().join(uri.pretty_escape()),
                format!("last-checked = {}\n", value),
            )?;

            let prefs = FeedPreferences::load_for_safe(temp_dir.path(), &uri);
            assert_eq!(prefs.last_checked, value);
            assert_eq!(prefs.last_checked(), DateTime::UNIX_EPOCH);
        }

        Ok(())
    }
}
