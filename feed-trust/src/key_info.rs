// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Querying a key information server about signing keys.

The server answers `GET <server>/key/<FINGERPRINT>` with a document like:

```xml
<key-lookup>
  <item vote="good">Thomas Leonard created Zero Install and ROX.</item>
</key-lookup>
```
*/

use {
    crate::{fetch::Fetcher, uri::with_trailing_slash, Result},
    implementation_store::CancellationToken,
    log::error,
    std::io::Cursor,
    url::Url,
    xml::reader::{EventReader, XmlEvent},
};

/// What a key information server said about a key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyInformation {
    /// Human-readable description of the key.
    pub description: Option<String>,
    /// Whether the server vouches for the key.
    pub good_vote: bool,
}

impl KeyInformation {
    /// Parse a server response.
    ///
    /// The first `item` element is used.
    pub fn from_xml(data: &[u8]) -> Result<Self> {
        let mut info = Self::default();
        let mut in_item = false;
        let mut text = String::new();

        for event in EventReader::new(Cursor::new(data)) {
            match event? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } if name.local_name == "item" => {
                    info.good_vote = attributes
                        .iter()
                        .any(|a| a.name.local_name == "vote" && a.value == "good");
                    in_item = true;
                }
                XmlEvent::Characters(s) | XmlEvent::CData(s) if in_item => {
                    text.push_str(&s);
                }
                XmlEvent::EndElement { name } if in_item && name.local_name == "item" => {
                    info.description = Some(text.trim().to_string());
                    return Ok(info);
                }
                _ => {}
            }
        }

        Ok(Self::default())
    }
}

/// Look up a key on a key information server.
///
/// Network and parse failures are logged and yield no information. Only
/// cancellation is reported as an error.
pub fn lookup(
    fetcher: &dyn Fetcher,
    server: &Url,
    fingerprint: &str,
    cancel: &CancellationToken,
) -> Result<KeyInformation> {
    let url = with_trailing_slash(server).join(&format!("key/{}", fingerprint))?;

    let data = match fetcher.fetch(&url, cancel) {
        Ok(data) => data,
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => {
            error!("unable to retrieve key information for {}: {}", fingerprint, e);
            return Ok(KeyInformation::default());
        }
    };
    cancel.check()?;

    match KeyInformation::from_xml(&data) {
        Ok(info) => Ok(info),
        Err(e) => {
            error!("unable to parse key information for {}: {}", fingerprint, e);
            Ok(KeyInformation::default())
        }
    }
}
