// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Feed URIs and their filesystem-safe encodings. */

use {
    crate::{FeedError, Result},
    std::{
        fmt,
        net::IpAddr,
        path::{Path, PathBuf},
        str::FromStr,
    },
    url::Url,
};

/// Identifies a feed: an HTTP(S) URL or an absolute local path.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FeedUri(Url);

impl FeedUri {
    /// Parse a URL or absolute path.
    pub fn parse(value: &str) -> Result<Self> {
        let path = Path::new(value);
        if path.is_absolute() && !value.contains("://") {
            return Self::from_file_path(path);
        }

        Self::from_url(Url::parse(value)?)
    }

    pub fn from_url(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" | "file" => Ok(Self(url)),
            _ => Err(FeedError::InvalidFeedUri(url.to_string())),
        }
    }

    pub fn from_file_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        Url::from_file_path(path)
            .map(Self)
            .map_err(|_| FeedError::InvalidFeedUri(format!("{}", path.display())))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether this refers to a file on the local filesystem.
    pub fn is_file(&self) -> bool {
        self.0.scheme() == "file"
    }

    /// The local filesystem path, for file URIs.
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_file() {
            self.0.to_file_path().ok()
        } else {
            None
        }
    }

    /// Whether the host is the local machine.
    pub fn is_loopback(&self) -> bool {
        match self.0.host() {
            Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
            Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
            None => false,
        }
    }

    /// The domain trust decisions are scoped to.
    pub fn domain(&self) -> Option<&str> {
        self.0.host_str()
    }

    /// The URI with every non-alphanumeric character percent encoded.
    pub fn escape(&self) -> String {
        escape(self.as_str())
    }

    /// The URI percent encoded with `/` mapped to `#`.
    pub fn pretty_escape(&self) -> String {
        pretty_escape(self.as_str())
    }

    /// Location of this feed on a feed mirror.
    ///
    /// Path segments are joined with `%23` so the whole path becomes a single
    /// segment below `feeds/<scheme>/<host>/`.
    pub fn mirror_url(&self, mirror: &Url) -> Result<Url> {
        let path = self.0.path().trim_start_matches('/').replace('/', "%23");

        Ok(with_trailing_slash(mirror).join(&format!(
            "feeds/{}/{}/{}/latest.xml",
            self.0.scheme(),
            self.0.host_str().unwrap_or_default(),
            path
        ))?)
    }
}

impl fmt::Display for FeedUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedUri {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Obtain a URL whose path ends with `/`, so relative joins append to it.
pub fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    url
}

fn push_escaped(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    for b in c.encode_utf8(&mut buf).bytes() {
        out.push_str(&format!("%{:02x}", b));
    }
}

/// Percent encode everything except letters, digits and `-_.`.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '-' | '_' | '.' => out.push(c),
            c if c.is_alphanumeric() => out.push(c),
            c => push_escaped(&mut out, c),
        }
    }

    out
}

/// Like [escape()] but `/` becomes `#` and `:` is kept on Unix.
pub fn pretty_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '/' => out.push('#'),
            ':' if cfg!(unix) => out.push(':'),
            '-' | '_' | '.' => out.push(c),
            c if c.is_alphanumeric() => out.push(c),
            c => push_escaped(&mut out, c),
        }
    }

    out
}

fn unescape_impl(value: &str, hash_is_slash: bool) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'#' if hash_is_slash => out.push(b'/'),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(b) => out.push(b),
                    None => out.extend_from_slice(&bytes[i..i + 3]),
                }
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).to_string()
}

/// Reverse [escape()].
pub fn unescape(value: &str) -> String {
    unescape_impl(value, false)
}

/// Reverse [pretty_escape()].
pub fn pretty_unescape(value: &str) -> String {
    unescape_impl(value, true)
}
