// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Manifests and manifest digests.

A manifest is a textual listing of a directory tree with one line per entry:

```text
F <content hash> <mtime> <size> <name>
X <content hash> <mtime> <size> <name>
S <target hash> <target size> <name>
D /<relative directory path>
```

Entries appear in [crate::walker::TreeWalker] order. The digest of a tree is
the hash of its manifest text and identifies the tree in a store.
*/

use {
    crate::{
        cancel::CancellationToken,
        error::{Result, StoreError},
        walker::{TreeVisitor, TreeWalker, WalkEntry, MANIFEST_FILE},
    },
    sha2::Digest,
    std::{fmt, io::Read, path::Path, str::FromStr},
    strum::IntoEnumIterator,
};

/// Supported manifest digest algorithms, most preferred first.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, strum::EnumIter)]
pub enum ManifestFormat {
    Sha256New,
    Sha256,
    Sha1New,
}

impl ManifestFormat {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256New => "sha256new",
            Self::Sha256 => "sha256",
            Self::Sha1New => "sha1new",
        }
    }

    /// Separator between prefix and value in digest ids.
    pub fn separator(&self) -> char {
        match self {
            Self::Sha256New => '_',
            Self::Sha256 | Self::Sha1New => '=',
        }
    }

    /// Determine the format of a digest id such as `sha256new_...`.
    pub fn from_id(id: &str) -> Result<Self> {
        Self::iter()
            .find(|f| {
                id.strip_prefix(f.prefix())
                    .map(|rest| rest.starts_with('=') || rest.starts_with('_'))
                    .unwrap_or(false)
            })
            .ok_or_else(|| StoreError::UnknownManifestFormat(id.to_string()))
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256New | Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha1New => sha1::Sha1::digest(data).to_vec(),
        }
    }

    fn hash_reader(&self, reader: &mut impl Read) -> Result<Vec<u8>> {
        let mut buffer = [0u8; 32768];

        macro_rules! digest_reader {
            ($hasher:expr) => {{
                let mut hasher = $hasher;
                loop {
                    let count = reader.read(&mut buffer)?;
                    if count == 0 {
                        break;
                    }
                    hasher.update(&buffer[..count]);
                }
                hasher.finalize().to_vec()
            }};
        }

        Ok(match self {
            Self::Sha256New | Self::Sha256 => digest_reader!(sha2::Sha256::new()),
            Self::Sha1New => digest_reader!(sha1::Sha1::new()),
        })
    }

    /// Serialize the hash of a manifest.
    fn serialize_manifest_hash(&self, hash: &[u8]) -> String {
        match self {
            Self::Sha256New => base32_encode(hash),
            Self::Sha256 | Self::Sha1New => hex::encode(hash),
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Lowercase RFC 4648 base32 without padding.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

    let mut result = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for byte in data {
        buffer = (buffer << 8) | *byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            result.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        result.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }

    result
}

/// The digests identifying an implementation, one per known format.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ManifestDigest {
    pub sha1new: Option<String>,
    pub sha256: Option<String>,
    pub sha256new: Option<String>,
}

impl ManifestDigest {
    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        match format {
            ManifestFormat::Sha256New => self.sha256new.as_deref(),
            ManifestFormat::Sha256 => self.sha256.as_deref(),
            ManifestFormat::Sha1New => self.sha1new.as_deref(),
        }
    }

    pub fn set(&mut self, format: ManifestFormat, value: String) {
        match format {
            ManifestFormat::Sha256New => self.sha256new = Some(value),
            ManifestFormat::Sha256 => self.sha256 = Some(value),
            ManifestFormat::Sha1New => self.sha1new = Some(value),
        }
    }

    /// Ids of all digests present, most preferred first.
    pub fn ids(&self) -> impl Iterator<Item = String> + '_ {
        ManifestFormat::iter().filter_map(move |format| {
            self.get(format)
                .map(|value| format!("{}{}{}", format.prefix(), format.separator(), value))
        })
    }

    /// The id of the most preferred digest present.
    pub fn best(&self) -> Option<String> {
        self.ids().next()
    }

    /// Whether two digests agree on at least one format.
    pub fn partial_eq(&self, other: &Self) -> bool {
        ManifestFormat::iter().any(|format| match (self.get(format), other.get(format)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }

    /// Compute digests of a directory in the given formats.
    pub fn compute(
        directory: &Path,
        formats: &[ManifestFormat],
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut digest = Self::default();
        for format in formats {
            let manifest = Manifest::generate(directory, *format, cancel)?;
            digest.set(*format, manifest.digest_value());
        }

        Ok(digest)
    }
}

impl FromStr for ManifestDigest {
    type Err = StoreError;

    fn from_str(id: &str) -> Result<Self> {
        let format = ManifestFormat::from_id(id)?;
        let value = &id[format.prefix().len() + 1..];

        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::BadManifestDigest(id.to_string()));
        }

        let mut digest = Self::default();
        digest.set(format, value.to_string());

        Ok(digest)
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.best().unwrap_or_default())
    }
}

/// The manifest of a directory tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Manifest {
    format: ManifestFormat,
    lines: Vec<String>,
}

struct ManifestGenerator {
    format: ManifestFormat,
    lines: Vec<String>,
}

impl TreeVisitor for ManifestGenerator {
    fn file(&mut self, entry: &WalkEntry, executable: bool) -> Result<()> {
        let mut fh = std::fs::File::open(&entry.path)
            .map_err(|e| StoreError::IoPath(format!("{}", entry.path.display()), e))?;
        let hash = hex::encode(self.format.hash_reader(&mut fh)?);

        self.lines.push(format!(
            "{} {} {} {} {}",
            if executable { "X" } else { "F" },
            hash,
            entry.mtime().unix_seconds(),
            entry.len(),
            entry.name()
        ));

        Ok(())
    }

    fn symlink(&mut self, entry: &WalkEntry, target: &str) -> Result<()> {
        self.lines.push(format!(
            "S {} {} {}",
            hex::encode(self.format.hash(target.as_bytes())),
            target.len(),
            entry.name()
        ));

        Ok(())
    }

    fn directory(&mut self, entry: &WalkEntry) -> Result<()> {
        self.lines.push(format!("D /{}", entry.relative));

        Ok(())
    }
}

impl Manifest {
    /// Generate the manifest of a directory.
    pub fn generate(
        directory: &Path,
        format: ManifestFormat,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut generator = ManifestGenerator {
            format,
            lines: vec![],
        };
        TreeWalker::new(directory).walk(&mut generator, cancel)?;

        Ok(Self {
            format,
            lines: generator.lines,
        })
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The manifest text, one entry per line.
    pub fn text(&self) -> String {
        self.lines.iter().map(|l| format!("{}\n", l)).collect()
    }

    /// The digest value of this manifest, without format prefix.
    pub fn digest_value(&self) -> String {
        self.format
            .serialize_manifest_hash(&self.format.hash(self.text().as_bytes()))
    }

    /// The full digest id of this manifest.
    pub fn digest_id(&self) -> String {
        format!(
            "{}{}{}",
            self.format.prefix(),
            self.format.separator(),
            self.digest_value()
        )
    }

    /// Write the manifest to the `.manifest` file of a directory.
    pub fn save(&self, directory: &Path) -> Result<()> {
        let path = directory.join(MANIFEST_FILE);
        std::fs::write(&path, self.text())
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))
    }
}

#[cfg(test)]
mod test {
    use {super::*, filetime::FileTime};

    fn temp_dir() -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("implementation-store-test")
            .tempdir()?)
    }

    fn write(path: &Path, data: &[u8], mtime: i64) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))?;
        Ok(())
    }

    #[test]
    fn base32() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "my");
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn parse_digest_ids() -> Result<()> {
        let digest = ManifestDigest::from_str("sha256new_abc234")?;
        assert_eq!(digest.sha256new.as_deref(), Some("abc234"));
        assert_eq!(digest.to_string(), "sha256new_abc234");

        let digest = ManifestDigest::from_str("sha1new=0123abcd")?;
        assert_eq!(digest.sha1new.as_deref(), Some("0123abcd"));
        assert_eq!(digest.to_string(), "sha1new=0123abcd");

        assert!(matches!(
            ManifestDigest::from_str("md5=abc"),
            Err(StoreError::UnknownManifestFormat(_))
        ));
        assert!(matches!(
            ManifestDigest::from_str("sha256=../x"),
            Err(StoreError::BadManifestDigest(_))
        ));

        Ok(())
    }

    #[test]
    fn manifest_lines() -> Result<()> {
        let dir = temp_dir()?;
        write(&dir.path().join("file"), b"hello", 100)?;
        write(&dir.path().join("sub/inner"), b"", 200)?;

        let cancel = CancellationToken::new();
        let manifest = Manifest::generate(dir.path(), ManifestFormat::Sha256, &cancel)?;
        assert_eq!(
            manifest.lines(),
            &[
                format!("F {} 100 5 file", hex::encode(sha2::Sha256::digest(b"hello"))),
                "D /sub".to_string(),
                format!("F {} 200 0 inner", hex::encode(sha2::Sha256::digest(b""))),
            ]
        );

        Ok(())
    }

    #[test]
    fn digest_deterministic() -> Result<()> {
        let a = temp_dir()?;
        let b = temp_dir()?;

        // Same tree, created in a different order.
        write(&a.path().join("x/1"), b"one", 10)?;
        write(&a.path().join("y"), b"two", 20)?;
        write(&a.path().join("x/2"), b"three", 30)?;

        write(&b.path().join("x/2"), b"three", 30)?;
        write(&b.path().join("y"), b"two", 20)?;
        write(&b.path().join("x/1"), b"one", 10)?;

        let formats = ManifestFormat::iter().collect::<Vec<_>>();
        let cancel = CancellationToken::new();

        let first = ManifestDigest::compute(a.path(), &formats, &cancel)?;
        let again = ManifestDigest::compute(a.path(), &formats, &cancel)?;
        let other = ManifestDigest::compute(b.path(), &formats, &cancel)?;

        assert_eq!(first, again);
        assert_eq!(first, other);
        assert!(first.sha256new.is_some());
        assert!(first.best().unwrap_or_default().starts_with("sha256new_"));

        // Saving the manifest does not change the digest.
        Manifest::generate(a.path(), ManifestFormat::Sha256New, &cancel)?.save(a.path())?;
        assert_eq!(ManifestDigest::compute(a.path(), &formats, &cancel)?, first);

        Ok(())
    }
}
