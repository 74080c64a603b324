// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Copying trees and files into a [DirectoryBuilder]. */

use {
    crate::{
        builder::DirectoryBuilder,
        cancel::CancellationToken,
        error::{Result, StoreError},
        path::set_write_protection,
        store::detect_implementation_path,
        walker::{
            platform_has_native_attributes, EntryKind, ExternalFlags, TreeVisitor, TreeWalker,
            WalkEntry,
        },
    },
    filetime::FileTime,
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Lifts write protection from a store entry until dropped.
struct UnsealGuard {
    path: PathBuf,
}

impl UnsealGuard {
    fn try_unseal(source: &Path) -> Option<Self> {
        let path = detect_implementation_path(source)?;

        match set_write_protection(&path, false) {
            Ok(()) => Some(Self { path }),
            Err(e) => {
                info!(
                    "unable to remove write protection from {} for creating hardlinks: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

impl Drop for UnsealGuard {
    fn drop(&mut self) {
        if let Err(e) = set_write_protection(&self.path, true) {
            warn!(
                "unable to restore write protection on {} after creating hardlinks: {}",
                self.path.display(),
                e
            );
        }
    }
}

fn copy_file(existing: &Path, new: &Path) -> Result<()> {
    let mut reader = std::fs::File::open(existing)
        .map_err(|e| StoreError::IoPath(format!("{}", existing.display()), e))?;
    crate::builder::write_file(new, &mut reader)
}

struct CloneVisitor<'a> {
    builder: &'a mut DirectoryBuilder,
    use_hardlinks: bool,
}

impl<'a> TreeVisitor for CloneVisitor<'a> {
    fn file(&mut self, entry: &WalkEntry, executable: bool) -> Result<()> {
        let new = self
            .builder
            .new_file_path(&entry.relative, Some(entry.mtime()), executable)?;

        if self.use_hardlinks {
            self.builder.link_or_copy(&entry.path, &new)
        } else {
            copy_file(&entry.path, &new)
        }
    }

    fn symlink(&mut self, entry: &WalkEntry, target: &str) -> Result<()> {
        self.builder.create_symlink(&entry.relative, target)
    }

    fn directory(&mut self, entry: &WalkEntry) -> Result<()> {
        self.builder
            .create_directory(&entry.relative, Some(entry.mtime()))
    }
}

/// Recreates a source directory inside a [DirectoryBuilder].
pub struct CloneDirectory {
    source: PathBuf,
    builder: DirectoryBuilder,
    use_hardlinks: bool,
    native_attributes: bool,
}

impl CloneDirectory {
    pub fn new(source: impl AsRef<Path>, builder: DirectoryBuilder) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            builder,
            use_hardlinks: false,
            native_attributes: platform_has_native_attributes(),
        }
    }

    /// Hardlink files instead of copying them where possible.
    pub fn use_hardlinks(mut self, value: bool) -> Self {
        self.use_hardlinks = value;
        self
    }

    /// Whether the source records executable bits and symlinks natively.
    pub fn native_attributes(mut self, value: bool) -> Self {
        self.native_attributes = value;
        self
    }

    pub fn builder(&self) -> &DirectoryBuilder {
        &self.builder
    }

    pub fn into_builder(self) -> DirectoryBuilder {
        self.builder
    }

    /// Perform the copy.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.builder.initialize()?;

        let _unseal = if self.use_hardlinks {
            UnsealGuard::try_unseal(&self.source)
        } else {
            None
        };

        let mut visitor = CloneVisitor {
            builder: &mut self.builder,
            use_hardlinks: self.use_hardlinks,
        };
        TreeWalker::new(&self.source)
            .native_attributes(self.native_attributes)
            .walk(&mut visitor, cancel)?;

        self.builder.complete_pending()
    }
}

/// Copy a single file into a [DirectoryBuilder] at `destination`.
///
/// Without `native_attributes`, symlink and executable flags are taken from
/// the flag files governing the source file's directory.
pub fn clone_file(
    source: &Path,
    builder: &mut DirectoryBuilder,
    destination: &str,
    use_hardlinks: bool,
    native_attributes: bool,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(source)
        .map_err(|e| StoreError::IoPath(format!("{}", source.display()), e))?;
    let directory = source.parent().unwrap_or_else(|| Path::new("."));
    let kind = ExternalFlags::load(directory, native_attributes)?.classify(source, &metadata)?;

    builder.initialize()?;
    let _unseal = if use_hardlinks {
        UnsealGuard::try_unseal(source)
    } else {
        None
    };

    match kind {
        EntryKind::Symlink { target } => builder.create_symlink(destination, &target)?,
        EntryKind::File { executable } => {
            let new = builder.new_file_path(
                destination,
                Some(FileTime::from_last_modification_time(&metadata)),
                executable,
            )?;

            if use_hardlinks {
                builder.link_or_copy(source, &new)?;
            } else {
                copy_file(source, &new)?;
            }
        }
    }

    builder.complete_pending()
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            builder::FilesystemCapabilities,
            flags::{self, FlagKind},
        },
    };

    fn temp_dir() -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("implementation-store-test")
            .tempdir()?)
    }

    fn failing_hardlink(_: &Path, _: &Path) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "hardlinks not permitted",
        ))
    }

    fn source_tree() -> Result<tempfile::TempDir> {
        let source = temp_dir()?;
        std::fs::create_dir_all(source.path().join("lib/nested"))?;
        std::fs::write(source.path().join("app"), b"application")?;
        std::fs::write(source.path().join("lib/nested/data"), b"data")?;
        std::fs::write(source.path().join("link"), b"app")?;
        flags::set(FlagKind::Executable, source.path(), "app")?;
        flags::set(FlagKind::Symlink, source.path(), "link")?;
        filetime::set_file_mtime(
            source.path().join("lib/nested/data"),
            FileTime::from_unix_time(1234, 0),
        )?;
        filetime::set_file_mtime(source.path().join("lib"), FileTime::from_unix_time(999, 0))?;
        Ok(source)
    }

    #[test]
    fn clone_with_hardlink_fallback() -> Result<()> {
        let source = source_tree()?;
        let target = temp_dir()?;

        let mut builder =
            DirectoryBuilder::with_capabilities(target.path(), FilesystemCapabilities::emulated());
        builder.set_hardlink_fn(failing_hardlink);

        let mut clone = CloneDirectory::new(source.path(), builder)
            .use_hardlinks(true)
            .native_attributes(false);
        clone.run(&CancellationToken::new())?;

        assert_eq!(std::fs::read(target.path().join("app"))?, b"application");
        assert_eq!(
            std::fs::read(target.path().join("lib/nested/data"))?,
            b"data"
        );
        assert_eq!(
            FileTime::from_last_modification_time(&std::fs::metadata(
                target.path().join("lib/nested/data")
            )?)
            .unix_seconds(),
            1234
        );
        assert_eq!(
            FileTime::from_last_modification_time(&std::fs::metadata(target.path().join("lib"))?)
                .unix_seconds(),
            999
        );
        assert_eq!(std::fs::read_to_string(target.path().join(".xbit"))?, "/app\n");
        assert_eq!(
            std::fs::read_to_string(target.path().join(".symlink"))?,
            "/link\n"
        );

        Ok(())
    }

    #[test]
    fn clone_into_suffix() -> Result<()> {
        let source = source_tree()?;
        let target = temp_dir()?;

        let mut builder =
            DirectoryBuilder::with_capabilities(target.path(), FilesystemCapabilities::emulated());
        builder.set_target_suffix("opt/pkg")?;

        let mut clone = CloneDirectory::new(source.path(), builder).native_attributes(false);
        clone.run(&CancellationToken::new())?;

        assert!(target.path().join("opt/pkg/lib/nested/data").is_file());
        assert_eq!(
            std::fs::read_to_string(target.path().join(".xbit"))?,
            "/opt/pkg/app\n"
        );

        Ok(())
    }

    #[test]
    fn clone_single_file() -> Result<()> {
        let source = source_tree()?;
        let target = temp_dir()?;

        let mut builder =
            DirectoryBuilder::with_capabilities(target.path(), FilesystemCapabilities::emulated());
        clone_file(
            &source.path().join("app"),
            &mut builder,
            "bin/tool",
            true,
            false,
        )?;

        assert_eq!(std::fs::read(target.path().join("bin/tool"))?, b"application");
        assert_eq!(
            std::fs::read_to_string(target.path().join(".xbit"))?,
            "/bin/tool\n"
        );

        Ok(())
    }
}
