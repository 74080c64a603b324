// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Incremental construction of a directory tree.

[DirectoryBuilder] writes files, directories and symlinks below a target
directory while recording the attributes that must be applied once all
content exists. Calling [DirectoryBuilder::complete_pending] applies them in
a fixed order:

1. Queued hardlinks are created (falling back to copies).
2. Executable bits are applied, natively or via the `.xbit` flag file.
3. File modification times are applied, then directory modification times
   in reverse creation order.

Directory times come last and deepest first because writing anything inside a
directory bumps that directory's own modification time.
*/

use {
    crate::{
        error::{Result, StoreError},
        flags::{self, FlagKind},
        path::{join_relative, normalize_relative, resolve, set_executable},
    },
    filetime::FileTime,
    log::debug,
    std::{
        collections::{BTreeMap, BTreeSet},
        io::Write,
        path::{Path, PathBuf},
    },
};

/// Header of a Cygwin-style symlink cookie file.
pub const CYGWIN_SYMLINK_COOKIE: &[u8] = b"!<symlink>";

/// How a filesystem can represent symlinks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymlinkSupport {
    /// Real symlinks.
    Native,
    /// Cygwin-style cookie files, for NTFS without symlink privileges.
    AltTool,
    /// Link target written as file content and recorded in the `.symlink` flag file.
    FlagFile,
}

/// What a target filesystem can natively store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FilesystemCapabilities {
    pub symlinks: SymlinkSupport,
    pub executable_bits: bool,
}

impl FilesystemCapabilities {
    /// Capabilities of a filesystem that supports nothing natively.
    pub fn emulated() -> Self {
        Self {
            symlinks: SymlinkSupport::FlagFile,
            executable_bits: false,
        }
    }

    /// Determine capabilities by experimenting inside `directory`.
    pub fn detect(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .map_err(|e| StoreError::IoPath(format!("{}", directory.display()), e))?;

        let scratch_dir = tempfile::Builder::new()
            .prefix(".capabilities")
            .tempdir_in(directory)?;

        let capabilities = Self::detect_in(scratch_dir.path())?;
        debug!(
            "filesystem at {} supports {:?}",
            directory.display(),
            capabilities
        );

        Ok(capabilities)
    }

    #[cfg(unix)]
    fn detect_in(dir: &Path) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let symlinks = match std::os::unix::fs::symlink("target", dir.join("link")) {
            Ok(()) => SymlinkSupport::Native,
            Err(_) => SymlinkSupport::FlagFile,
        };

        let file = dir.join("file");
        std::fs::write(&file, b"")?;
        let executable_bits = set_executable(&file).is_ok()
            && std::fs::metadata(&file)?.permissions().mode() & 0o111 != 0;

        Ok(Self {
            symlinks,
            executable_bits,
        })
    }

    #[cfg(windows)]
    fn detect_in(dir: &Path) -> Result<Self> {
        let symlinks = match std::os::windows::fs::symlink_file("target", dir.join("link")) {
            Ok(()) => SymlinkSupport::Native,
            Err(_) => SymlinkSupport::AltTool,
        };

        Ok(Self {
            symlinks,
            executable_bits: false,
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn detect_in(_dir: &Path) -> Result<Self> {
        Ok(Self::emulated())
    }
}

/// Function used to create a hardlink at `new` pointing to `existing`.
pub type HardlinkFn = fn(existing: &Path, new: &Path) -> std::io::Result<()>;

fn native_hardlink(existing: &Path, new: &Path) -> std::io::Result<()> {
    std::fs::hard_link(existing, new)
}

/// Builds a directory tree, deferring hardlinks and metadata until the end.
///
/// All relative paths are relative to the effective target path (the target
/// path plus an optional suffix) and are rejected if they would escape it.
/// Flag files always live at the target path itself.
#[derive(Debug)]
pub struct DirectoryBuilder {
    target_path: PathBuf,
    target_suffix: String,
    capabilities: FilesystemCapabilities,
    hardlink: HardlinkFn,

    pending_directory_times: Vec<(String, FileTime)>,
    pending_file_times: BTreeMap<String, FileTime>,
    pending_executables: BTreeSet<String>,
    /// New path -> existing path, both relative.
    pending_hardlinks: BTreeMap<String, String>,
}

impl DirectoryBuilder {
    /// Construct an instance, probing the capabilities of the target filesystem.
    pub fn new(target_path: impl AsRef<Path>) -> Result<Self> {
        let target_path = target_path.as_ref();
        let capabilities = FilesystemCapabilities::detect(target_path)?;

        Ok(Self::with_capabilities(target_path, capabilities))
    }

    /// Construct an instance with explicitly defined filesystem capabilities.
    pub fn with_capabilities(
        target_path: impl AsRef<Path>,
        capabilities: FilesystemCapabilities,
    ) -> Self {
        Self {
            target_path: target_path.as_ref().to_path_buf(),
            target_suffix: String::new(),
            capabilities,
            hardlink: native_hardlink,
            pending_directory_times: vec![],
            pending_file_times: BTreeMap::new(),
            pending_executables: BTreeSet::new(),
            pending_hardlinks: BTreeMap::new(),
        }
    }

    /// Replace the function used to create hardlinks.
    pub fn set_hardlink_fn(&mut self, f: HardlinkFn) {
        self.hardlink = f;
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn target_suffix(&self) -> &str {
        &self.target_suffix
    }

    pub fn capabilities(&self) -> FilesystemCapabilities {
        self.capabilities
    }

    /// Place all subsequent content below a sub-directory of the target.
    pub fn set_target_suffix(&mut self, suffix: &str) -> Result<()> {
        self.target_suffix = normalize_relative(suffix)?;
        Ok(())
    }

    /// The directory relative paths are resolved against.
    pub fn effective_target_path(&self) -> Result<PathBuf> {
        resolve(&self.target_path, &self.target_suffix)
    }

    /// Ensure the effective target directory exists.
    pub fn initialize(&mut self) -> Result<()> {
        let path = self.effective_target_path()?;
        std::fs::create_dir_all(&path)
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;

        Ok(())
    }

    /// Resolve a relative path to an absolute one.
    pub fn full_path(&self, relative: &str) -> Result<PathBuf> {
        resolve(&self.effective_target_path()?, relative)
    }

    fn flag_relative_path(&self, relative: &str) -> Result<String> {
        Ok(join_relative(
            &self.target_suffix,
            &normalize_relative(relative)?,
        ))
    }

    fn non_empty(relative: &str, operation: &'static str) -> Result<String> {
        let normalized = normalize_relative(relative)?;
        if normalized.is_empty() {
            Err(StoreError::EmptyPath(operation))
        } else {
            Ok(normalized)
        }
    }

    /// Create a directory and record its modification time, if known.
    pub fn create_directory(&mut self, relative: &str, mtime: Option<FileTime>) -> Result<()> {
        let relative = Self::non_empty(relative, "create_directory")?;
        let path = self.full_path(&relative)?;

        std::fs::create_dir_all(&path)
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        if let Some(mtime) = mtime {
            self.pending_directory_times.push((relative, mtime));
        }

        Ok(())
    }

    /// Obtain the path a new file should be written to.
    ///
    /// Whatever previously existed at the path is deleted along with its flags
    /// and the parent directory is created. The caller writes the content.
    pub fn new_file_path(
        &mut self,
        relative: &str,
        mtime: Option<FileTime>,
        executable: bool,
    ) -> Result<PathBuf> {
        let relative = Self::non_empty(relative, "new_file_path")?;
        let path = self.full_path(&relative)?;

        self.delete_file(&relative)?;
        create_parent(&path)?;

        if let Some(mtime) = mtime {
            self.pending_file_times.insert(relative.clone(), mtime);
        }
        if executable {
            self.pending_executables.insert(relative);
        }

        Ok(path)
    }

    /// Create a symlink pointing to `target`.
    pub fn create_symlink(&mut self, relative: &str, target: &str) -> Result<()> {
        let relative = Self::non_empty(relative, "create_symlink")?;
        let path = self.full_path(&relative)?;
        let flag_path = self.flag_relative_path(&relative)?;

        self.delete_file(&relative)?;
        create_parent(&path)?;

        match self.capabilities.symlinks {
            SymlinkSupport::Native => create_native_symlink(target, &path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?,
            SymlinkSupport::AltTool => {
                let mut data = CYGWIN_SYMLINK_COOKIE.to_vec();
                data.extend_from_slice(&[0xff, 0xfe]);
                for unit in target.encode_utf16() {
                    data.extend_from_slice(&unit.to_le_bytes());
                }
                data.extend_from_slice(&[0, 0]);
                std::fs::write(&path, data)?;
            }
            SymlinkSupport::FlagFile => {
                std::fs::write(&path, target.as_bytes())?;
                flags::set(FlagKind::Symlink, &self.target_path, &flag_path)?;
            }
        }

        Ok(())
    }

    /// Queue a hardlink at `relative` pointing to the existing `existing_relative`.
    pub fn queue_hardlink(
        &mut self,
        relative: &str,
        existing_relative: &str,
        executable: bool,
    ) -> Result<()> {
        let relative = Self::non_empty(relative, "queue_hardlink")?;
        let existing = Self::non_empty(existing_relative, "queue_hardlink")?;
        self.full_path(&relative)?;
        self.full_path(&existing)?;

        if executable {
            self.pending_executables.insert(relative.clone());
        }
        self.pending_hardlinks.insert(relative, existing);

        Ok(())
    }

    /// Hardlink `existing` to `new`, copying if the link cannot be made.
    pub fn link_or_copy(&self, existing: &Path, new: &Path) -> Result<()> {
        match (self.hardlink)(existing, new) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::IoPath(format!("{}", existing.display()), e))
            }
            Err(e) => {
                debug!(
                    "unable to hardlink {}; copying instead: {}",
                    existing.display(),
                    e
                );
                std::fs::copy(existing, new)
                    .map_err(|e| StoreError::IoPath(format!("{}", new.display()), e))?;
                Ok(())
            }
        }
    }

    /// Apply everything that was deferred until all content exists.
    pub fn complete_pending(&mut self) -> Result<()> {
        self.create_pending_hardlinks()?;
        self.apply_pending_executables()?;
        self.apply_pending_times()?;

        Ok(())
    }

    fn create_pending_hardlinks(&mut self) -> Result<()> {
        for (relative, existing) in std::mem::take(&mut self.pending_hardlinks) {
            let path = self.full_path(&relative)?;
            let existing_path = self.full_path(&existing)?;

            self.remove_existing(&relative)?;
            create_parent(&path)?;
            self.link_or_copy(&existing_path, &path)?;
        }

        Ok(())
    }

    fn apply_pending_executables(&mut self) -> Result<()> {
        for relative in std::mem::take(&mut self.pending_executables) {
            if self.capabilities.executable_bits {
                let path = self.full_path(&relative)?;
                set_executable(&path)
                    .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
            } else {
                let flag_path = self.flag_relative_path(&relative)?;
                flags::set(FlagKind::Executable, &self.target_path, &flag_path)?;
            }
        }

        Ok(())
    }

    fn apply_pending_times(&mut self) -> Result<()> {
        for (relative, mtime) in std::mem::take(&mut self.pending_file_times) {
            let path = self.full_path(&relative)?;
            filetime::set_file_mtime(&path, mtime)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        }

        for (relative, mtime) in std::mem::take(&mut self.pending_directory_times)
            .into_iter()
            .rev()
        {
            let path = self.full_path(&relative)?;
            filetime::set_file_mtime(&path, mtime)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        }

        Ok(())
    }

    /// Delete a file along with its pending operations and flags.
    pub fn delete_file(&mut self, relative: &str) -> Result<()> {
        let relative = normalize_relative(relative)?;

        self.pending_file_times.remove(&relative);
        self.pending_executables.remove(&relative);
        self.pending_hardlinks.remove(&relative);

        self.remove_existing(&relative)
    }

    fn remove_existing(&self, relative: &str) -> Result<()> {
        let path = self.full_path(relative)?;
        let flag_path = self.flag_relative_path(relative)?;

        flags::remove(FlagKind::Symlink, &self.target_path, &flag_path)?;
        flags::remove(FlagKind::Executable, &self.target_path, &flag_path)?;

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if !metadata.is_dir() => std::fs::remove_file(&path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e)),
            _ => Ok(()),
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::IoPath(format!("{}", parent.display()), e))?;
    }

    Ok(())
}

#[cfg(unix)]
fn create_native_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn create_native_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

#[cfg(not(any(unix, windows)))]
fn create_native_symlink(_target: &str, _path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

/// Write all of a reader's content to a new file.
pub(crate) fn write_file(path: &Path, reader: &mut impl std::io::Read) -> Result<()> {
    let mut fh = std::fs::File::create(path)
        .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
    std::io::copy(reader, &mut fh)?;
    fh.flush()?;

    Ok(())
}
