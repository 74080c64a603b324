// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cross-process advisory locks. */

use {
    crate::error::{Result, StoreError},
    fs2::FileExt,
    log::warn,
    std::{
        fs::File,
        path::{Path, PathBuf},
    },
};

/// An exclusive lock on a `.lock` file, held until dropped.
///
/// Acquisition blocks while another process holds the lock.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquire the lock for a resource.
    ///
    /// The lock file is `<resource>.lock` next to the resource.
    pub fn for_resource(resource: impl AsRef<Path>) -> Result<Self> {
        let resource = resource.as_ref();
        let mut name = resource
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        name.push(".lock");

        Self::acquire(resource.with_file_name(name))
    }

    /// Acquire a lock on an explicit lock file path.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::IoPath(format!("{}", parent.display()), e))?;
        }

        let file = File::create(&path)
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_file_next_to_resource() -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("implementation-store-test")
            .tempdir()?;
        let resource = temp_dir.path().join("trustdb.xml");

        {
            let lock = FileLock::for_resource(&resource)?;
            assert_eq!(lock.path(), temp_dir.path().join("trustdb.xml.lock"));
            assert!(lock.path().exists());
        }

        // Released on drop, so it can be taken again.
        let _lock = FileLock::for_resource(&resource)?;

        Ok(())
    }
}
