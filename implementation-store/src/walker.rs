// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deterministic traversal of directory trees.

Entries are emitted in a fixed order regardless of how the filesystem
enumerates them: at each level, files sorted ordinally by name, then
directories sorted ordinally by name, each directory followed by its own
contents. Symlinked directories are reported as symlinks and never descended
into.
*/

use {
    crate::{
        builder::CYGWIN_SYMLINK_COOKIE,
        cancel::CancellationToken,
        error::{Result, StoreError},
        flags::{self, FlagKind},
        path::{is_executable, relative_to},
    },
    filetime::FileTime,
    std::{
        collections::BTreeSet,
        ffi::OsString,
        fs::Metadata,
        io::Read,
        path::{Path, PathBuf},
    },
};

/// Name of the manifest file stored at the root of an implementation.
pub const MANIFEST_FILE: &str = ".manifest";

/// A filesystem entry encountered during a walk.
#[derive(Clone, Debug)]
pub struct WalkEntry {
    /// Path relative to the walk root, `/` separated.
    pub relative: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Metadata of the entry itself, not following symlinks.
    pub metadata: Metadata,
}

impl WalkEntry {
    pub fn mtime(&self) -> FileTime {
        FileTime::from_last_modification_time(&self.metadata)
    }

    pub fn len(&self) -> u64 {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        self.relative
            .rsplit('/')
            .next()
            .unwrap_or(self.relative.as_str())
    }
}

/// How a non-directory entry is represented in a tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File { executable: bool },
    Symlink { target: String },
}

/// Receives the entries of a tree walk.
pub trait TreeVisitor {
    fn file(&mut self, entry: &WalkEntry, executable: bool) -> Result<()>;

    fn symlink(&mut self, entry: &WalkEntry, target: &str) -> Result<()>;

    fn directory(&mut self, entry: &WalkEntry) -> Result<()>;
}

/// Whether filesystems on this platform natively record executable bits and symlinks.
pub fn platform_has_native_attributes() -> bool {
    cfg!(unix)
}

/// Determines how the non-directory entries of a tree are represented.
///
/// On filesystems with native executable bits and symlinks, those are
/// authoritative and flag files are ignored. Elsewhere, flag files and
/// Cygwin-style symlink cookies supply the attributes.
#[derive(Clone, Debug, Default)]
pub struct ExternalFlags {
    native: bool,
    executables: BTreeSet<PathBuf>,
    symlinks: BTreeSet<PathBuf>,
}

impl ExternalFlags {
    /// Load the flag files governing `directory`.
    ///
    /// Nothing is read when `native` is set.
    pub fn load(directory: &Path, native: bool) -> Result<Self> {
        if native {
            return Ok(Self {
                native,
                ..Default::default()
            });
        }

        Ok(Self {
            native,
            executables: flags::flagged_paths(FlagKind::Executable, directory)?,
            symlinks: flags::flagged_paths(FlagKind::Symlink, directory)?,
        })
    }

    /// Determine how a non-directory entry should be represented.
    pub fn classify(&self, path: &Path, metadata: &Metadata) -> Result<EntryKind> {
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
            let target = target
                .to_str()
                .ok_or_else(|| StoreError::SymlinkTargetNotUtf8(format!("{}", path.display())))?;

            return Ok(EntryKind::Symlink {
                target: target.to_string(),
            });
        }

        if !file_type.is_file() {
            return Err(StoreError::UnsupportedFileType(format!(
                "{}",
                path.display()
            )));
        }

        if self.native {
            return Ok(EntryKind::File {
                executable: is_executable(metadata),
            });
        }

        if let Some(target) = read_cygwin_symlink(path, metadata)? {
            return Ok(EntryKind::Symlink { target });
        }

        if self.symlinks.contains(path) {
            let data = std::fs::read(path)?;
            let target = String::from_utf8(data)
                .map_err(|_| StoreError::SymlinkTargetNotUtf8(format!("{}", path.display())))?;

            Ok(EntryKind::Symlink { target })
        } else {
            Ok(EntryKind::File {
                executable: self.executables.contains(path),
            })
        }
    }
}

fn read_cygwin_symlink(path: &Path, metadata: &Metadata) -> Result<Option<String>> {
    if metadata.len() < CYGWIN_SYMLINK_COOKIE.len() as u64 + 2 || metadata.len() > 4096 {
        return Ok(None);
    }

    let mut data = vec![];
    std::fs::File::open(path)?.read_to_end(&mut data)?;

    let Some(rest) = data.strip_prefix(CYGWIN_SYMLINK_COOKIE) else {
        return Ok(None);
    };
    let Some(rest) = rest.strip_prefix(&[0xff, 0xfe]) else {
        return Ok(None);
    };

    let units = rest
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect::<Vec<_>>();

    Ok(String::from_utf16(&units).ok())
}

#[derive(Debug)]
struct Listed {
    name: OsString,
    path: PathBuf,
    metadata: Metadata,
    descend: bool,
}

/// Split directory listing results into files and directories, each sorted by name.
fn sort_listing(listing: Vec<Listed>) -> (Vec<Listed>, Vec<Listed>) {
    let (mut files, mut directories): (Vec<_>, Vec<_>) =
        listing.into_iter().partition(|l| !is_directory_like(l));

    files.sort_by(|a, b| a.name.cmp(&b.name));
    directories.sort_by(|a, b| a.name.cmp(&b.name));

    (files, directories)
}

fn is_directory_like(listed: &Listed) -> bool {
    listed.descend
        || (listed.metadata.file_type().is_symlink()
            && std::fs::metadata(&listed.path)
                .map(|m| m.is_dir())
                .unwrap_or(false))
}

/// Walks a directory tree in deterministic order.
pub struct TreeWalker {
    source: PathBuf,
    native_attributes: bool,
}

impl TreeWalker {
    pub fn new(source: impl AsRef<Path>) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            native_attributes: platform_has_native_attributes(),
        }
    }

    /// Whether the source records executable bits and symlinks natively.
    ///
    /// Defaults to [platform_has_native_attributes()]. When unset, flag files
    /// are consulted instead.
    pub fn native_attributes(mut self, value: bool) -> Self {
        self.native_attributes = value;
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Collect every entry below the source in walk order.
    pub fn entries(&self) -> Result<Vec<WalkEntry>> {
        let mut entries = vec![];
        self.collect(&self.source, &mut entries)?;
        Ok(entries)
    }

    fn collect(&self, directory: &Path, entries: &mut Vec<WalkEntry>) -> Result<()> {
        let mut listing = vec![];

        for entry in std::fs::read_dir(directory)
            .map_err(|e| StoreError::IoPath(format!("{}", directory.display()), e))?
        {
            let entry = entry?;
            let path = entry.path();
            let metadata = std::fs::symlink_metadata(&path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;

            listing.push(Listed {
                name: entry.file_name(),
                descend: metadata.is_dir(),
                path,
                metadata,
            });
        }

        let (files, directories) = sort_listing(listing);

        for listed in files {
            entries.push(WalkEntry {
                relative: relative_to(&listed.path, &self.source)?,
                path: listed.path,
                metadata: listed.metadata,
            });
        }

        for listed in directories {
            let path = listed.path.clone();
            entries.push(WalkEntry {
                relative: relative_to(&listed.path, &self.source)?,
                path: listed.path,
                metadata: listed.metadata,
            });

            if listed.descend {
                self.collect(&path, entries)?;
            }
        }

        Ok(())
    }

    /// Walk the tree, passing each entry to a visitor.
    ///
    /// Tree metadata files (the manifest and flag files) are not reported.
    pub fn walk(&self, visitor: &mut impl TreeVisitor, cancel: &CancellationToken) -> Result<()> {
        let external = ExternalFlags::load(&self.source, self.native_attributes)?;

        for entry in self.entries()? {
            cancel.check()?;

            if entry.metadata.is_dir() {
                visitor.directory(&entry)?;
                continue;
            }

            let name = entry.name();
            if name == MANIFEST_FILE || FlagKind::is_flag_file(name) {
                continue;
            }

            match external.classify(&entry.path, &entry.metadata)? {
                EntryKind::Symlink { target } => visitor.symlink(&entry, &target)?,
                EntryKind::File { executable } => visitor.file(&entry, executable)?,
            }
        }

        Ok(())
    }
}
