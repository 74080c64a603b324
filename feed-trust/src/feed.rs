// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The parts of feed documents needed to acquire them safely. */

use {
    crate::{FeedError, Result},
    std::io::Cursor,
    xml::reader::{EventReader, XmlEvent},
};

pub const FEED_NAMESPACE: &str = "http://zero-install.sourceforge.net/2004/injector/interface";

/// A parsed feed document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Feed {
    /// The URI the feed declares for itself.
    pub uri: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
}

impl Feed {
    /// Parse a feed document.
    ///
    /// The root element must be `interface` or `feed`. Trailing comments,
    /// such as a signature block, are permitted.
    pub fn from_xml(data: &[u8]) -> Result<Self> {
        let mut feed: Option<Feed> = None;
        let mut depth = 0usize;
        let mut field: Option<String> = None;
        let mut text = String::new();

        for event in EventReader::new(Cursor::new(data)) {
            match event.map_err(|e| FeedError::InvalidFeed(e.to_string()))? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    depth += 1;

                    if depth == 1 {
                        if name.local_name != "interface" && name.local_name != "feed" {
                            return Err(FeedError::InvalidFeed(format!(
                                "unexpected root element {}",
                                name.local_name
                            )));
                        }

                        feed = Some(Feed {
                            uri: attributes
                                .iter()
                                .find(|a| a.name.local_name == "uri" && a.name.namespace.is_none())
                                .map(|a| a.value.clone()),
                            name: None,
                            summary: None,
                        });
                    } else if depth == 2
                        && (name.local_name == "name" || name.local_name == "summary")
                    {
                        field = Some(name.local_name);
                        text.clear();
                    }
                }
                XmlEvent::Characters(s) if field.is_some() => text.push_str(&s),
                XmlEvent::EndElement { .. } => {
                    if depth == 2 {
                        if let (Some(f), Some(feed)) = (field.take(), feed.as_mut()) {
                            let value = Some(text.trim().to_string());
                            match f.as_str() {
                                "name" => feed.name = value,
                                _ => feed.summary = value,
                            }
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
        }

        feed.ok_or_else(|| FeedError::InvalidFeed("document has no root element".into()))
    }
}
