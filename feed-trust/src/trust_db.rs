// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Database of keys trusted to sign feeds for specific domains.

The database is persisted as an XML document:

```xml
<trusted-keys xmlns="http://zero-install.sourceforge.net/2007/injector/trust">
  <key fingerprint="88C8A1F375928691D7365C0259AA3927C24E4E1E">
    <domain value="example.org" />
  </key>
</trusted-keys>
```
*/

use {
    crate::{FeedError, Result},
    implementation_store::FileLock,
    log::{debug, warn},
    std::{
        collections::{BTreeMap, BTreeSet},
        io::{Cursor, Write},
        path::Path,
    },
    xml::{
        common::XmlVersion,
        reader::{self, EventReader},
        writer::{self, EmitterConfig},
    },
};

pub const TRUST_NAMESPACE: &str = "http://zero-install.sourceforge.net/2007/injector/trust";

/// Fingerprints mapped to the domains they are trusted for.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrustDb {
    keys: BTreeMap<String, BTreeSet<String>>,
}

impl TrustDb {
    /// Whether a key is trusted to sign feeds from `domain`.
    pub fn is_trusted(&self, fingerprint: &str, domain: &str) -> bool {
        self.keys
            .get(fingerprint)
            .map(|domains| domains.contains(domain))
            .unwrap_or(false)
    }

    /// Trust a key for a domain. Repeated grants have no further effect.
    pub fn trust_key(&mut self, fingerprint: &str, domain: &str) {
        self.keys
            .entry(fingerprint.to_string())
            .or_default()
            .insert(domain.to_string());
    }

    /// Stop trusting a key for a domain.
    ///
    /// Returns whether the key was trusted for the domain.
    pub fn untrust_key(&mut self, fingerprint: &str, domain: &str) -> bool {
        let removed = match self.keys.get_mut(fingerprint) {
            Some(domains) => domains.remove(domain),
            None => false,
        };

        if self.keys.get(fingerprint).map(|d| d.is_empty()) == Some(true) {
            self.keys.remove(fingerprint);
        }

        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse the XML form.
    pub fn from_xml(data: &[u8]) -> Result<Self> {
        let mut db = Self::default();
        let mut current: Option<String> = None;

        for event in EventReader::new(Cursor::new(data)) {
            match event? {
                reader::XmlEvent::StartElement {
                    name, attributes, ..
                } => match name.local_name.as_str() {
                    "key" => {
                        let fingerprint = attributes
                            .iter()
                            .find(|a| a.name.local_name == "fingerprint")
                            .ok_or_else(|| {
                                FeedError::InvalidTrustDb("key without fingerprint".into())
                            })?;
                        current = Some(fingerprint.value.clone());
                    }
                    "domain" => {
                        let fingerprint = current.as_ref().ok_or_else(|| {
                            FeedError::InvalidTrustDb("domain outside of key".into())
                        })?;
                        let value = attributes.iter().find(|a| a.name.local_name == "value");
                        if let Some(value) = value {
                            db.trust_key(fingerprint, &value.value);
                        }
                    }
                    _ => {}
                },
                reader::XmlEvent::EndElement { name } if name.local_name == "key" => {
                    current = None;
                }
                _ => {}
            }
        }

        Ok(db)
    }

    /// Serialize to XML.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let config = EmitterConfig::new().perform_indent(true);
        let mut emitter = config.create_writer(Vec::<u8>::new());

        emitter.write(writer::XmlEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: None,
        })?;
        emitter.write(writer::XmlEvent::start_element("trusted-keys").default_ns(TRUST_NAMESPACE))?;

        for (fingerprint, domains) in &self.keys {
            emitter.write(writer::XmlEvent::start_element("key").attr("fingerprint", fingerprint))?;
            for domain in domains {
                emitter.write(writer::XmlEvent::start_element("domain").attr("value", domain))?;
                emitter.write(writer::XmlEvent::end_element())?;
            }
            emitter.write(writer::XmlEvent::end_element())?;
        }

        emitter.write(writer::XmlEvent::end_element())?;

        let mut data = emitter.into_inner();
        data.push(b'\n');

        Ok(data)
    }

    /// Load the database from a file.
    ///
    /// A missing file is an empty database.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match std::fs::read(path) {
            Ok(data) => Self::from_xml(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(FeedError::IoPath(format!("{}", path.display()), e)),
        }
    }

    /// Load the database, falling back to an empty one on any error.
    pub fn load_safe(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        match Self::load(path) {
            Ok(db) => db,
            Err(e) => {
                warn!("unable to load trust database {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the database to a file, replacing it atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .ok_or_else(|| FeedError::InvalidOperation(format!("{}", path.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| FeedError::IoPath(format!("{}", parent.display()), e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&self.to_xml()?)?;
        temp.persist(path)?;

        Ok(())
    }

    /// Apply a change to the database stored at `path`.
    ///
    /// The file is locked for the duration, reloaded, changed and saved, so
    /// changes made by other processes in the meantime are kept.
    pub fn modify<F>(path: impl AsRef<Path>, f: F) -> Result<Self>
    where
        F: FnOnce(&mut Self),
    {
        let path = path.as_ref();
        let _lock = FileLock::for_resource(path)?;

        let mut db = Self::load(path)?;
        f(&mut db);
        db.save(path)?;
        debug!("updated trust database {}", path.display());

        Ok(db)
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    const FINGERPRINT: &str = "88C8A1F375928691D7365C0259AA3927C24E4E1E";

    #[test]
    fn trust_idempotent() {
        let mut db = TrustDb::default();
        db.trust_key(FINGERPRINT, "example.org");
        db.trust_key(FINGERPRINT, "example.org");

        assert!(db.is_trusted(FINGERPRINT, "example.org"));
        assert!(!db.is_trusted(FINGERPRINT, "www.example.org"));
        assert_eq!(db.keys().count(), 1);
        assert_eq!(db.keys().next().map(|(_, d)| d.len()), Some(1));

        assert!(db.untrust_key(FINGERPRINT, "example.org"));
        assert!(!db.untrust_key(FINGERPRINT, "example.org"));
        assert_eq!(db.keys().count(), 0);
    }

    #[test]
    fn parse_xml() -> Result<()> {
        let db = TrustDb::from_xml(
            indoc! {r#"
            <?xml version="1.0" ?>
            <trusted-keys xmlns="http://zero-install.sourceforge.net/2007/injector/trust">
              <key fingerprint="88C8A1F375928691D7365C0259AA3927C24E4E1E">
                <domain value="example.org"/>
                <domain value="0install.net"/>
              </key>
              <key fingerprint="DA9825AECAD089757CDABD8E07133F96CA74D8BA">
                <domain value="0install.net"/>
              </key>
            </trusted-keys>
        "#}
            .as_bytes(),
        )?;

        assert!(db.is_trusted(FINGERPRINT, "example.org"));
        assert!(db.is_trusted(FINGERPRINT, "0install.net"));
        assert!(db.is_trusted("DA9825AECAD089757CDABD8E07133F96CA74D8BA", "0install.net"));
        assert!(!db.is_trusted("DA9825AECAD089757CDABD8E07133F96CA74D8BA", "example.org"));

        assert_eq!(TrustDb::from_xml(&db.to_xml()?)?, db);

        Ok(())
    }

    #[test]
    fn load_save_modify() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("feed-trust-test")
            .tempdir()?;
        let path = temp_dir.path().join("injector").join("trustdb.xml");

        assert_eq!(TrustDb::load(&path)?, TrustDb::default());

        TrustDb::modify(&path, |db| db.trust_key(FINGERPRINT, "example.org"))?;
        TrustDb::modify(&path, |db| db.trust_key(FINGERPRINT, "example.com"))?;

        let db = TrustDb::load(&path)?;
        assert!(db.is_trusted(FINGERPRINT, "example.org"));
        assert!(db.is_trusted(FINGERPRINT, "example.com"));
        assert!(std::fs::read_to_string(&path)?.contains(TRUST_NAMESPACE));

        std::fs::write(&path, b"<trusted-keys>")?;
        assert!(TrustDb::load(&path).is_err());
        assert_eq!(TrustDb::load_safe(&path), TrustDb::default());

        Ok(())
    }
}
