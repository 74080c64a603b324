// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Catalogs: signed lists of known feeds.

Catalogs are fetched from a user-editable list of sources, one URI per line.
Remote catalogs are signed like feeds. The merged result of all sources is
cached locally.
*/

use {
    crate::{
        fetch::Fetcher, handler::TaskHandler, locations::Locations, trust_manager::TrustManager,
        uri::FeedUri, FeedError, Result,
    },
    implementation_store::FileLock,
    log::{debug, info, warn},
    std::{
        collections::BTreeSet,
        io::{Cursor, Write},
        path::{Path, PathBuf},
    },
    xml::{
        common::XmlVersion,
        reader::{self, EventReader},
        writer::{self, EmitterConfig},
    },
};

pub const DEFAULT_CATALOG_SOURCE: &str = "http://0install.de/catalog/";
pub const CATALOG_NAMESPACE: &str = "http://0install.de/schema/injector/catalog";

/// A feed listed in a catalog.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CatalogEntry {
    pub uri: String,
    pub name: Option<String>,
}

/// A list of feeds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Catalog {
    pub feeds: Vec<CatalogEntry>,
}

impl Catalog {
    /// Parse a `<catalog>` document.
    ///
    /// Entry names come from a `name` attribute or a `<name>` child.
    pub fn from_xml(data: &[u8]) -> Result<Self> {
        let mut catalog = Self::default();
        let mut depth = 0usize;
        let mut seen_root = false;
        let mut in_name = false;
        let mut text = String::new();

        for event in EventReader::new(Cursor::new(data)) {
            match event.map_err(|e| FeedError::InvalidCatalog(e.to_string()))? {
                reader::XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    depth += 1;
                    let attribute = |key: &str| {
                        attributes
                            .iter()
                            .find(|a| a.name.local_name == key)
                            .map(|a| a.value.clone())
                    };

                    match (depth, name.local_name.as_str()) {
                        (1, "catalog") => seen_root = true,
                        (1, other) => {
                            return Err(FeedError::InvalidCatalog(format!(
                                "unexpected root element {}",
                                other
                            )))
                        }
                        (2, "interface") | (2, "feed") => match attribute("uri") {
                            Some(uri) => catalog.feeds.push(CatalogEntry {
                                uri,
                                name: attribute("name"),
                            }),
                            None => warn!("ignoring catalog entry without uri"),
                        },
                        (3, "name") => {
                            in_name = true;
                            text.clear();
                        }
                        _ => {}
                    }
                }
                reader::XmlEvent::Characters(s) if in_name => text.push_str(&s),
                reader::XmlEvent::EndElement { .. } => {
                    if in_name && depth == 3 {
                        in_name = false;
                        if let Some(entry) = catalog.feeds.last_mut() {
                            entry.name.get_or_insert_with(|| text.trim().to_string());
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
        }

        if !seen_root {
            return Err(FeedError::InvalidCatalog("document has no catalog element".into()));
        }

        Ok(catalog)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let config = EmitterConfig::new().perform_indent(true);
        let mut emitter = config.create_writer(Vec::<u8>::new());

        emitter.write(writer::XmlEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: None,
        })?;
        emitter.write(writer::XmlEvent::start_element("catalog").default_ns(CATALOG_NAMESPACE))?;

        for entry in &self.feeds {
            emitter.write(writer::XmlEvent::start_element("interface").attr("uri", &entry.uri))?;
            if let Some(name) = &entry.name {
                emitter.write(writer::XmlEvent::start_element("name"))?;
                emitter.write(writer::XmlEvent::characters(name))?;
                emitter.write(writer::XmlEvent::end_element())?;
            }
            emitter.write(writer::XmlEvent::end_element())?;
        }

        emitter.write(writer::XmlEvent::end_element())?;

        let mut data = emitter.into_inner();
        data.push(b'\n');

        Ok(data)
    }

    /// Combine catalogs. The first entry for a URI wins.
    pub fn merge(catalogs: impl IntoIterator<Item = Catalog>) -> Self {
        let mut seen = BTreeSet::new();
        let mut merged = Self::default();

        for catalog in catalogs {
            for entry in catalog.feeds {
                if seen.insert(entry.uri.clone()) {
                    merged.feeds.push(entry);
                }
            }
        }

        merged
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<&CatalogEntry> {
        self.feeds.iter().find(|e| e.uri == uri)
    }
}

/// Read the list of catalog sources.
fn read_sources(path: &Path) -> Result<Vec<FeedUri>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(vec![FeedUri::parse(DEFAULT_CATALOG_SOURCE)?])
        }
        Err(e) => return Err(FeedError::IoPath(format!("{}", path.display()), e)),
    };

    data.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(FeedUri::parse)
        .collect()
}

/// Manages catalog sources and the merged catalog.
pub struct CatalogManager<'a> {
    sources_path: PathBuf,
    cache_path: PathBuf,
    trust_manager: &'a TrustManager<'a>,
    fetcher: &'a dyn Fetcher,
    handler: &'a dyn TaskHandler,
}

impl<'a> CatalogManager<'a> {
    pub fn new(
        locations: &Locations,
        trust_manager: &'a TrustManager<'a>,
        fetcher: &'a dyn Fetcher,
        handler: &'a dyn TaskHandler,
    ) -> Self {
        Self {
            sources_path: locations.catalog_sources(),
            cache_path: locations.catalog_cache(),
            trust_manager,
            fetcher,
            handler,
        }
    }

    /// The configured catalog sources.
    ///
    /// Without a sources file, the default source is used.
    pub fn sources(&self) -> Result<Vec<FeedUri>> {
        read_sources(&self.sources_path)
    }

    /// Replace the list of sources.
    pub fn set_sources(&self, sources: &[FeedUri]) -> Result<()> {
        let parent = self.sources_path.parent().ok_or_else(|| {
            FeedError::InvalidOperation(format!("{}", self.sources_path.display()))
        })?;
        std::fs::create_dir_all(parent)
            .map_err(|e| FeedError::IoPath(format!("{}", parent.display()), e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        for source in sources {
            writeln!(temp, "{}", source)?;
        }
        temp.persist(&self.sources_path)?;

        Ok(())
    }

    /// Add a source. Returns false if it was already present.
    pub fn add_source(&self, uri: &FeedUri) -> Result<bool> {
        let mut sources = self.sources()?;
        if sources.contains(uri) {
            return Ok(false);
        }

        sources.push(uri.clone());
        self.set_sources(&sources)?;

        Ok(true)
    }

    /// Remove a source. Returns false if it was not present.
    pub fn remove_source(&self, uri: &FeedUri) -> Result<bool> {
        let mut sources = self.sources()?;
        let count = sources.len();
        sources.retain(|s| s != uri);
        if sources.len() == count {
            return Ok(false);
        }

        self.set_sources(&sources)?;

        Ok(true)
    }

    /// The merged catalog from the last online update, if any.
    pub fn get_cached(&self) -> Result<Option<Catalog>> {
        let _lock = FileLock::for_resource(&self.cache_path)?;

        match std::fs::read(&self.cache_path) {
            Ok(data) => Ok(Some(Catalog::from_xml(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FeedError::IoPath(format!("{}", self.cache_path.display()), e)),
        }
    }

    /// Fetch all sources and cache the merged catalog.
    ///
    /// Failing to write the cache does not fail the operation.
    pub fn get_online(&self) -> Result<Catalog> {
        let catalogs = self
            .sources()?
            .iter()
            .map(|source| self.download_catalog(source))
            .collect::<Result<Vec<_>>>()?;
        let merged = Catalog::merge(catalogs);

        if let Err(e) = self.save_cache(&merged) {
            warn!("unable to cache catalog {}: {}", self.cache_path.display(), e);
        }

        Ok(merged)
    }

    /// Obtain and verify the catalog of a single source.
    pub fn download_catalog(&self, source: &FeedUri) -> Result<Catalog> {
        if let Some(path) = source.local_path() {
            debug!("reading local catalog {}", path.display());
            let data = std::fs::read(&path)
                .map_err(|e| FeedError::IoPath(format!("{}", path.display()), e))?;

            return Catalog::from_xml(&data);
        }

        info!("downloading catalog {}", source);
        let data = self
            .fetcher
            .fetch(source.as_url(), self.handler.cancellation())?;
        self.trust_manager.check_trust(&data, source, None)?;

        Catalog::from_xml(&data)
    }

    fn save_cache(&self, catalog: &Catalog) -> Result<()> {
        let _lock = FileLock::for_resource(&self.cache_path)?;
        let parent = self
            .cache_path
            .parent()
            .ok_or_else(|| FeedError::InvalidOperation(format!("{}", self.cache_path.display())))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&catalog.to_xml()?)?;
        temp.persist(&self.cache_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{config::Config, feed_cache::FeedCache, testutil::*, trust_db::TrustDb},
        indoc::indoc,
    };

    const REMOTE_CATALOG: &str = indoc! {r#"
        <?xml version="1.0" ?>
        <catalog xmlns="http://0install.de/schema/injector/catalog">
          <interface uri="https://example.org/app.xml">
            <name>App</name>
          </interface>
          <interface uri="https://example.org/tool.xml" name="Tool"/>
        </catalog>
    "#};

    #[test]
    fn parse_and_merge() -> Result<()> {
        let remote = Catalog::from_xml(REMOTE_CATALOG.as_bytes())?;
        assert_eq!(
            remote.feeds,
            vec![
                CatalogEntry {
                    uri: "https://example.org/app.xml".into(),
                    name: Some("App".into()),
                },
                CatalogEntry {
                    uri: "https://example.org/tool.xml".into(),
                    name: Some("Tool".into()),
                },
            ]
        );
        assert_eq!(Catalog::from_xml(&remote.to_xml()?)?, remote);

        let other = Catalog {
            feeds: vec![
                CatalogEntry {
                    uri: "https://example.org/app.xml".into(),
                    name: Some("Duplicate".into()),
                },
                CatalogEntry {
                    uri: "https://example.com/lib.xml".into(),
                    name: None,
                },
            ],
        };
        let merged = Catalog::merge(vec![remote, other]);
        assert_eq!(merged.feeds.len(), 3);
        assert_eq!(
            merged
                .find_by_uri("https://example.org/app.xml")
                .and_then(|e| e.name.as_deref()),
            Some("App")
        );

        assert!(matches!(
            Catalog::from_xml(b"<interface/>"),
            Err(FeedError::InvalidCatalog(_))
        ));

        Ok(())
    }

    #[test]
    fn sources_file() -> Result<()> {
        let (_temp_dir, locations) = temp_locations()?;
        let config = Config::default();
        let feed_cache = FeedCache::new(locations.feed_cache_dir());
        let openpgp = FakeOpenPgp::default();
        let fetcher = FakeFetcher::default();
        let handler = RecordingHandler::new(false);
        let trust = TrustManager::new(
            &config,
            locations.trust_db(),
            &openpgp,
            &feed_cache,
            &fetcher,
            &handler,
        );
        let catalogs = CatalogManager::new(&locations, &trust, &fetcher, &handler);

        let default = FeedUri::parse(DEFAULT_CATALOG_SOURCE)?;
        assert_eq!(catalogs.sources()?, vec![default.clone()]);

        std::fs::create_dir_all(locations.catalog_sources().parent().unwrap_or(Path::new(".")))?;
        std::fs::write(
            locations.catalog_sources(),
            "# my catalogs\n\nhttps://example.org/catalog.xml\n",
        )?;
        let custom = FeedUri::parse("https://example.org/catalog.xml")?;
        assert_eq!(catalogs.sources()?, vec![custom.clone()]);

        assert!(catalogs.add_source(&default)?);
        assert!(!catalogs.add_source(&default)?);
        assert_eq!(catalogs.sources()?, vec![custom.clone(), default.clone()]);

        assert!(catalogs.remove_source(&custom)?);
        assert!(!catalogs.remove_source(&custom)?);
        assert_eq!(catalogs.sources()?, vec![default]);

        catalogs.set_sources(&[])?;
        assert!(catalogs.sources()?.is_empty());

        Ok(())
    }

    #[test]
    fn online_and_cached() -> Result<()> {
        let (temp_dir, locations) = temp_locations()?;
        TrustDb::modify(locations.trust_db(), |db| db.trust_key(FINGERPRINT, "example.org"))?;
        let config = Config::default();
        let feed_cache = FeedCache::new(locations.feed_cache_dir());
        let openpgp = FakeOpenPgp::with_key(KEY_ID, FINGERPRINT);
        let fetcher = FakeFetcher::default();
        let handler = RecordingHandler::new(false);
        let trust = TrustManager::new(
            &config,
            locations.trust_db(),
            &openpgp,
            &feed_cache,
            &fetcher,
            &handler,
        );
        let catalogs = CatalogManager::new(&locations, &trust, &fetcher, &handler);

        fetcher.serve(
            "https://example.org/catalog.xml",
            signed_document(
                REMOTE_CATALOG.as_bytes(),
                &[fake_signature(KEY_ID, FINGERPRINT, 1_600_000_000)],
            )?,
        );
        let local_path = temp_dir.path().join("local-catalog.xml");
        std::fs::write(
            &local_path,
            indoc! {r#"
                <catalog xmlns="http://0install.de/schema/injector/catalog">
                  <interface uri="https://example.com/lib.xml" name="Lib"/>
                </catalog>
            "#},
        )?;
        catalogs.set_sources(&[
            FeedUri::parse("https://example.org/catalog.xml")?,
            FeedUri::from_file_path(&local_path)?,
        ])?;

        assert_eq!(catalogs.get_cached()?, None);

        let catalog = catalogs.get_online()?;
        assert_eq!(catalog.feeds.len(), 3);
        assert!(catalog.find_by_uri("https://example.com/lib.xml").is_some());
        assert_eq!(catalogs.get_cached()?, Some(catalog));

        Ok(())
    }

    #[test]
    fn untrusted_catalog_rejected() -> Result<()> {
        let (_temp_dir, locations) = temp_locations()?;
        let config = Config {
            key_info_server: String::new(),
            ..Config::default()
        };
        let feed_cache = FeedCache::new(locations.feed_cache_dir());
        let openpgp = FakeOpenPgp::with_key(KEY_ID, FINGERPRINT);
        let fetcher = FakeFetcher::default();
        let handler = RecordingHandler::new(false);
        let trust = TrustManager::new(
            &config,
            locations.trust_db(),
            &openpgp,
            &feed_cache,
            &fetcher,
            &handler,
        );
        let catalogs = CatalogManager::new(&locations, &trust, &fetcher, &handler);

        fetcher.serve(
            DEFAULT_CATALOG_SOURCE,
            signed_document(
                REMOTE_CATALOG.as_bytes(),
                &[fake_signature(KEY_ID, FINGERPRINT, 1_600_000_000)],
            )?,
        );

        assert!(matches!(
            catalogs.get_online(),
            Err(FeedError::NoTrustedSignatures(_))
        ));
        assert_eq!(handler.questions().len(), 1);

        Ok(())
    }

    #[test]
    fn cache_write_failure_tolerated() -> Result<()> {
        let (temp_dir, locations) = temp_locations()?;
        // A regular file where the cache directory should be.
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"")?;
        let locations = Locations::new(locations.config_dir(), &blocker);

        let config = Config::default();
        let feed_cache = FeedCache::new(temp_dir.path().join("interfaces"));
        let openpgp = FakeOpenPgp::default();
        let fetcher = FakeFetcher::default();
        let handler = RecordingHandler::new(false);
        let trust = TrustManager::new(
            &config,
            locations.trust_db(),
            &openpgp,
            &feed_cache,
            &fetcher,
            &handler,
        );
        let catalogs = CatalogManager::new(&locations, &trust, &fetcher, &handler);

        let local_path = temp_dir.path().join("local-catalog.xml");
        std::fs::write(&local_path, REMOTE_CATALOG)?;
        catalogs.set_sources(&[FeedUri::from_file_path(&local_path)?])?;

        assert_eq!(catalogs.get_online()?.feeds.len(), 2);

        Ok(())
    }
}
