// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Archive extraction into a [DirectoryBuilder].

The extractor is chosen from the archive's MIME type. Archives may start at
a byte offset within the file (self-extracting archives) and extraction may
be limited to a single sub-directory of the archive, which then becomes the
root of the extracted tree. Member paths escaping the tree abort extraction.
*/

use {
    crate::{
        builder::{write_file, DirectoryBuilder},
        cancel::CancellationToken,
        error::{Result, StoreError},
        path::normalize_relative,
    },
    chrono::NaiveDate,
    filetime::FileTime,
    log::debug,
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::Path,
    },
};

pub const MIME_TAR: &str = "application/x-tar";
pub const MIME_TAR_GZIP: &str = "application/x-compressed-tar";
pub const MIME_TAR_XZ: &str = "application/x-xz-compressed-tar";
pub const MIME_TAR_ZSTD: &str = "application/x-zstd-compressed-tar";
pub const MIME_ZIP: &str = "application/zip";

/// Archive formats that can be extracted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveFormat {
    Tar,
    TarGzip,
    TarXz,
    TarZstd,
    Zip,
}

impl ArchiveFormat {
    pub fn from_mime_type(mime_type: &str) -> Result<Self> {
        match mime_type {
            MIME_TAR => Ok(Self::Tar),
            MIME_TAR_GZIP => Ok(Self::TarGzip),
            MIME_TAR_XZ => Ok(Self::TarXz),
            MIME_TAR_ZSTD => Ok(Self::TarZstd),
            MIME_ZIP => Ok(Self::Zip),
            _ => Err(StoreError::UnsupportedArchiveType(mime_type.to_string())),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Tar => MIME_TAR,
            Self::TarGzip => MIME_TAR_GZIP,
            Self::TarXz => MIME_TAR_XZ,
            Self::TarZstd => MIME_TAR_ZSTD,
            Self::Zip => MIME_ZIP,
        }
    }
}

/// Guess the MIME type of an archive from its file name.
pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let name = file_name.to_lowercase();

    [
        (".tar.gz", MIME_TAR_GZIP),
        (".tgz", MIME_TAR_GZIP),
        (".tar.xz", MIME_TAR_XZ),
        (".txz", MIME_TAR_XZ),
        (".tar.zst", MIME_TAR_ZSTD),
        (".tar", MIME_TAR),
        (".zip", MIME_ZIP),
    ]
    .iter()
    .find(|(suffix, _)| name.ends_with(suffix))
    .map(|(_, mime)| *mime)
}

/// A file viewed from a byte offset onwards.
struct OffsetFile {
    file: File,
    offset: u64,
}

impl OffsetFile {
    fn open(path: &Path, offset: u64) -> Result<Self> {
        let mut file =
            File::open(path).map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        if offset > file.metadata()?.len() {
            return Err(StoreError::ArchiveOffsetOutOfRange(offset));
        }
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self { file, offset })
    }
}

impl Read for OffsetFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for OffsetFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(n) => self.file.seek(SeekFrom::Start(n + self.offset))?,
            other => self.file.seek(other)?,
        };

        if absolute < self.offset {
            self.file.seek(SeekFrom::Start(self.offset))?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of archive",
            ));
        }

        Ok(absolute - self.offset)
    }
}

/// Extracts archive members into a builder.
pub struct ArchiveExtractor<'a> {
    builder: &'a mut DirectoryBuilder,
    extract: String,
    cancel: CancellationToken,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(builder: &'a mut DirectoryBuilder, cancel: &CancellationToken) -> Self {
        Self {
            builder,
            extract: String::new(),
            cancel: cancel.clone(),
        }
    }

    /// Only extract the content of a sub-directory of the archive.
    pub fn set_extract(&mut self, sub_dir: &str) -> Result<()> {
        self.extract = normalize_relative(sub_dir)?;
        Ok(())
    }

    /// Map an archive member name to a path relative to the builder.
    ///
    /// Returns `None` for members outside the extracted sub-directory.
    fn member_path(&self, name: &str) -> Result<Option<String>> {
        let normalized = normalize_relative(name)?;

        if self.extract.is_empty() {
            return Ok(Some(normalized));
        }

        if normalized == self.extract {
            Ok(Some(String::new()))
        } else {
            Ok(normalized
                .strip_prefix(&format!("{}/", self.extract))
                .map(|s| s.to_string()))
        }
    }

    /// Extract an archive file starting at `start_offset`.
    pub fn extract(&mut self, path: &Path, format: ArchiveFormat, start_offset: u64) -> Result<()> {
        self.builder.initialize()?;
        let file = OffsetFile::open(path, start_offset)?;

        match format {
            ArchiveFormat::Tar => self.extract_tar(file)?,
            ArchiveFormat::TarGzip => self.extract_tar(flate2::read::GzDecoder::new(file))?,
            ArchiveFormat::TarXz => self.extract_tar(xz2::read::XzDecoder::new(file))?,
            ArchiveFormat::TarZstd => self.extract_tar(zstd::stream::read::Decoder::new(file)?)?,
            ArchiveFormat::Zip => self.extract_zip(file)?,
        }

        self.builder.complete_pending()
    }

    fn extract_tar(&mut self, reader: impl Read) -> Result<()> {
        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries()? {
            self.cancel.check()?;
            let mut entry = entry?;

            let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();
            let Some(relative) = self.member_path(&name)? else {
                continue;
            };

            let header = entry.header();
            let mtime = FileTime::from_unix_time(header.mtime()? as i64, 0);
            let entry_type = header.entry_type();

            if entry_type.is_dir() {
                if !relative.is_empty() {
                    self.builder.create_directory(&relative, Some(mtime))?;
                }
            } else if entry_type.is_file() {
                let executable = header.mode()? & 0o111 != 0;
                let path = self.builder.new_file_path(&relative, Some(mtime), executable)?;
                write_file(&path, &mut entry)?;
            } else if entry_type.is_symlink() {
                let target = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).to_string())
                    .unwrap_or_default();
                self.builder.create_symlink(&relative, &target)?;
            } else if entry_type.is_hard_link() {
                let target = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).to_string())
                    .unwrap_or_default();
                let executable = header.mode()? & 0o111 != 0;

                match self.member_path(&target)? {
                    Some(existing) if !existing.is_empty() => {
                        self.builder.queue_hardlink(&relative, &existing, executable)?
                    }
                    _ => debug!("skipping hardlink {} to {} outside extraction", name, target),
                }
            } else {
                debug!("skipping unsupported tar entry {} ({:?})", name, entry_type);
            }
        }

        Ok(())
    }

    fn extract_zip(&mut self, file: OffsetFile) -> Result<()> {
        let mut archive = zip::ZipArchive::new(file)?;

        for index in 0..archive.len() {
            self.cancel.check()?;
            let mut member = archive.by_index(index)?;

            let name = member.name().to_string();
            let Some(relative) = self.member_path(&name)? else {
                continue;
            };

            let mtime = zip_mtime(&member.last_modified());
            if mtime.is_none() {
                debug!("{} has an invalid modification time", name);
            }
            let mode = member.unix_mode().unwrap_or(0);

            if member.is_dir() {
                if !relative.is_empty() {
                    self.builder.create_directory(&relative, mtime)?;
                }
            } else if mode & 0o170000 == 0o120000 {
                let mut target = String::new();
                member.read_to_string(&mut target)?;
                self.builder.create_symlink(&relative, &target)?;
            } else {
                let path = self
                    .builder
                    .new_file_path(&relative, mtime, mode & 0o111 != 0)?;
                write_file(&path, &mut member)?;
            }
        }

        Ok(())
    }
}

/// Convert a zip timestamp, treated as UTC, to a file time.
///
/// Returns `None` for timestamps that are not a valid date and time.
fn zip_mtime(dt: &zip::DateTime) -> Option<FileTime> {
    let seconds = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
        .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?
        .and_utc()
        .timestamp();

    Some(FileTime::from_unix_time(seconds, 0))
}
