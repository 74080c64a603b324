// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Local storage of downloaded feed documents.

Each feed is stored verbatim, signature block included, in a file named
after the [escaped](crate::uri::escape) feed URI. Parsed feeds are also kept
in memory until [FeedCache::flush()] is called.
*/

use {
    crate::{feed::Feed, uri::FeedUri, FeedError, Result},
    feed_signature::{OpenPgp, Signature},
    implementation_store::FileLock,
    log::{debug, warn},
    std::{
        collections::HashMap,
        io::Write,
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

/// A directory of cached feed documents.
pub struct FeedCache {
    dir: PathBuf,
    parsed: Mutex<HashMap<FeedUri, Feed>>,
}

impl FeedCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            parsed: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the document for a feed is read from.
    ///
    /// Local feeds are read from their own path.
    pub fn path(&self, uri: &FeedUri) -> PathBuf {
        match uri.local_path() {
            Some(path) => path,
            None => self.dir.join(uri.escape()),
        }
    }

    pub fn contains(&self, uri: &FeedUri) -> bool {
        self.path(uri).is_file()
    }

    /// Obtain the raw document for a feed.
    pub fn get_data(&self, uri: &FeedUri) -> Result<Vec<u8>> {
        let path = self.path(uri);

        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FeedError::FeedNotCached(uri.to_string()))
            }
            Err(e) => Err(FeedError::IoPath(format!("{}", path.display()), e)),
        }
    }

    /// Obtain the parsed feed.
    pub fn get_feed(&self, uri: &FeedUri) -> Result<Feed> {
        if let Some(feed) = self.parsed.lock().ok().and_then(|p| p.get(uri).cloned()) {
            return Ok(feed);
        }

        let feed = Feed::from_xml(&self.get_data(uri)?)?;
        if let Ok(mut parsed) = self.parsed.lock() {
            parsed.insert(uri.clone(), feed.clone());
        }

        Ok(feed)
    }

    /// Signatures on the cached document of a feed.
    pub fn signatures(&self, uri: &FeedUri, openpgp: &dyn OpenPgp) -> Result<Vec<Signature>> {
        Ok(feed_signature::signatures(openpgp, &self.get_data(uri)?)?)
    }

    fn forget(&self, uri: &FeedUri) {
        if let Ok(mut parsed) = self.parsed.lock() {
            parsed.remove(uri);
        }
    }

    /// Store a feed document, replacing any previous version atomically.
    pub fn add(&self, uri: &FeedUri, data: &[u8]) -> Result<()> {
        if uri.is_file() {
            return Err(FeedError::InvalidOperation(uri.to_string()));
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| FeedError::IoPath(format!("{}", self.dir.display()), e))?;
        let _lock = FileLock::for_resource(&self.dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(data)?;
        temp.persist(self.path(uri))?;
        self.forget(uri);

        debug!("cached feed {}", uri);

        Ok(())
    }

    /// Delete the cached document of a feed.
    pub fn remove(&self, uri: &FeedUri) -> Result<()> {
        if uri.is_file() {
            return Err(FeedError::InvalidOperation(uri.to_string()));
        }

        let _lock = FileLock::for_resource(&self.dir)?;
        let path = self.path(uri);
        self.forget(uri);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FeedError::FeedNotCached(uri.to_string()))
            }
            Err(e) => Err(FeedError::IoPath(format!("{}", path.display()), e)),
        }
    }

    /// URIs of all cached feeds, sorted.
    pub fn list_all(&self) -> Result<Vec<FeedUri>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(FeedError::IoPath(format!("{}", self.dir.display()), e)),
        };

        let mut uris = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("http") {
                continue;
            }

            match FeedUri::parse(&crate::uri::unescape(&name)) {
                Ok(uri) => uris.push(uri),
                Err(e) => warn!("ignoring unrecognized cache entry {}: {}", name, e),
            }
        }
        uris.sort();

        Ok(uris)
    }

    /// Drop parsed feeds held in memory.
    pub fn flush(&self) {
        if let Ok(mut parsed) = self.parsed.lock() {
            parsed.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::testutil::*};

    #[test]
    fn add_get_remove() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let cache = FeedCache::new(temp_dir.path().join("interfaces"));
        let uri = FeedUri::parse("https://example.org/app.xml")?;

        assert!(!cache.contains(&uri));
        assert!(matches!(
            cache.get_feed(&uri),
            Err(FeedError::FeedNotCached(_))
        ));
        assert!(cache.list_all()?.is_empty());

        cache.add(&uri, &feed_document(&uri, "App"))?;
        assert!(cache.contains(&uri));
        assert!(temp_dir
            .path()
            .join("interfaces")
            .join("https%3a%2f%2fexample.org%2fapp.xml")
            .is_file());
        assert_eq!(cache.get_feed(&uri)?.name.as_deref(), Some("App"));

        cache.add(&uri, &feed_document(&uri, "Renamed"))?;
        assert_eq!(cache.get_feed(&uri)?.name.as_deref(), Some("Renamed"));
        assert_eq!(cache.list_all()?, vec![uri.clone()]);

        cache.remove(&uri)?;
        assert!(!cache.contains(&uri));
        assert!(matches!(cache.remove(&uri), Err(FeedError::FeedNotCached(_))));

        Ok(())
    }

    #[test]
    fn local_feeds() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let cache = FeedCache::new(temp_dir.path().join("interfaces"));

        let path = temp_dir.path().join("local.xml");
        let uri = FeedUri::from_file_path(&path)?;
        std::fs::write(&path, feed_document(&uri, "Local"))?;

        assert!(cache.contains(&uri));
        assert_eq!(cache.get_feed(&uri)?.name.as_deref(), Some("Local"));

        std::fs::write(&path, feed_document(&uri, "Changed"))?;
        assert_eq!(cache.get_feed(&uri)?.name.as_deref(), Some("Local"));
        cache.flush();
        assert_eq!(cache.get_feed(&uri)?.name.as_deref(), Some("Changed"));

        assert!(matches!(
            cache.add(&uri, b"<interface/>"),
            Err(FeedError::InvalidOperation(_))
        ));

        Ok(())
    }
}
