// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content-addressed storage of implementation directories. */

use {
    crate::{
        builder::DirectoryBuilder,
        cancel::CancellationToken,
        clone::CloneDirectory,
        error::{Result, StoreError},
        lock::FileLock,
        manifest::{Manifest, ManifestDigest, ManifestFormat},
        path::set_write_protection,
        recipe::{self, Recipe, RecipeContext},
    },
    log::{info, warn},
    std::{
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// Resolves implementation digests to directories holding their content.
pub trait ImplementationSource {
    /// Obtain the directory of an implementation, if available.
    fn implementation_path(&self, digest: &ManifestDigest) -> Option<PathBuf>;
}

/// Find the store entry enclosing a path, if the path lies inside one.
///
/// A store entry is a directory whose name is a manifest digest id.
pub fn detect_implementation_path(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| ManifestDigest::from_str(n).is_ok())
                .unwrap_or(false)
        })
        .map(|p| p.to_path_buf())
}

/// A store keeping implementations in directories named after their digest.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Construct an instance rooted at a directory, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::IoPath(format!("{}", root.display()), e))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(self.root.join(".lock"))
    }

    /// Whether an implementation matching any of a digest's values is stored.
    pub fn contains(&self, digest: &ManifestDigest) -> bool {
        self.path(digest).is_some()
    }

    /// The directory holding an implementation.
    pub fn path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        digest
            .ids()
            .map(|id| self.root.join(id))
            .find(|p| p.is_dir())
    }

    /// Digests of all stored implementations.
    pub fn list_all(&self) -> Result<Vec<ManifestDigest>> {
        let mut digests = vec![];

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(digest) = entry
                .file_name()
                .to_str()
                .and_then(|n| ManifestDigest::from_str(n).ok())
            {
                digests.push(digest);
            }
        }

        digests.sort_by_key(|d| d.best());
        Ok(digests)
    }

    /// Copy a directory into the store after verifying its digest.
    pub fn add_directory(
        &self,
        source: &Path,
        expected: &ManifestDigest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let temp_dir = tempfile::Builder::new()
            .prefix("temp-")
            .tempdir_in(&self.root)?;

        let mut clone = CloneDirectory::new(source, DirectoryBuilder::new(temp_dir.path())?);
        clone.run(cancel)?;

        self.commit(temp_dir, expected, cancel)
    }

    /// Build an implementation from a recipe and add it to the store.
    pub fn add_recipe(
        &self,
        recipe: &Recipe,
        downloaded_files: &[PathBuf],
        expected: &ManifestDigest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let context = RecipeContext {
            cancel: cancel.clone(),
            implementations: self,
        };
        let working = recipe::apply_in(recipe, downloaded_files, &context, &self.root)?;

        self.commit(working, expected, cancel)
    }

    fn commit(
        &self,
        temp_dir: tempfile::TempDir,
        expected: &ManifestDigest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let format = ManifestFormat::from_id(
            &expected
                .best()
                .ok_or_else(|| StoreError::BadManifestDigest(String::new()))?,
        )?;

        let manifest = Manifest::generate(temp_dir.path(), format, cancel)?;
        let actual = manifest.digest_value();
        let expected_value = expected.get(format).unwrap_or_default();

        if actual != expected_value {
            return Err(StoreError::DigestMismatch {
                expected: expected.best().unwrap_or_default(),
                actual: manifest.digest_id(),
            });
        }

        manifest.save(temp_dir.path())?;
        cancel.check()?;

        let _lock = self.lock()?;
        let id = manifest.digest_id();
        let target = self.root.join(&id);
        if target.exists() {
            return Err(StoreError::ImplementationAlreadyInStore(id));
        }

        let temp_path = temp_dir.into_path();
        if let Err(e) = std::fs::rename(&temp_path, &target) {
            if let Err(e) = remove_dir_all::remove_dir_all(&temp_path) {
                warn!("unable to remove {}: {}", temp_path.display(), e);
            }
            return Err(StoreError::IoPath(format!("{}", target.display()), e));
        }

        if let Err(e) = set_write_protection(&target, true) {
            warn!("unable to write protect {}: {}", target.display(), e);
        }
        info!("added {} to store {}", id, self.root.display());

        Ok(target)
    }

    /// Remove an implementation from the store.
    pub fn remove(&self, digest: &ManifestDigest) -> Result<()> {
        let _lock = self.lock()?;
        let path = self
            .path(digest)
            .ok_or_else(|| StoreError::ImplementationNotFound(digest.to_string()))?;

        set_write_protection(&path, false)
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        remove_dir_all::remove_dir_all(&path)
            .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;

        Ok(())
    }
}

impl ImplementationSource for DirectoryStore {
    fn implementation_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.path(digest)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_dir() -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("implementation-store-test")
            .tempdir()?)
    }

    fn sample_tree(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir.join("bin"))?;
        std::fs::write(dir.join("bin/app"), b"#!/bin/sh\necho hi\n")?;
        std::fs::write(dir.join("README"), b"readme")?;
        Ok(())
    }

    #[test]
    fn add_verifies_digest() -> Result<()> {
        let source = temp_dir()?;
        sample_tree(source.path())?;
        let cancel = CancellationToken::new();

        let store_dir = temp_dir()?;
        let store = DirectoryStore::new(store_dir.path())?;

        let wrong = ManifestDigest::from_str("sha256new_aaaa")?;
        assert!(matches!(
            store.add_directory(source.path(), &wrong, &cancel),
            Err(StoreError::DigestMismatch { .. })
        ));
        assert!(store.list_all()?.is_empty());

        // Copies keep modification times, so the digest of the source applies.
        let digest = ManifestDigest::compute(source.path(), &[ManifestFormat::Sha256New], &cancel)?;
        let path = store.add_directory(source.path(), &digest, &cancel)?;

        assert!(store.contains(&digest));
        assert_eq!(store.path(&digest), Some(path.clone()));
        assert_eq!(store.list_all()?, vec![digest.clone()]);
        assert!(path.join(".manifest").exists());
        assert_eq!(detect_implementation_path(&path.join("bin/app")), Some(path.clone()));

        assert!(matches!(
            store.add_directory(source.path(), &digest, &cancel),
            Err(StoreError::ImplementationAlreadyInStore(_))
        ));

        store.remove(&digest)?;
        assert!(!store.contains(&digest));

        Ok(())
    }

    #[test]
    fn detect_outside_store() {
        assert_eq!(detect_implementation_path(Path::new("/tmp/foo/bar")), None);
    }
}
