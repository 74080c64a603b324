// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Recipes for reconstructing implementation directories.

A [Recipe] is an ordered list of [Step]s applied to an initially empty
working directory. Steps that need downloaded content ([Step::Archive] and
[Step::SingleFile]) each consume the next file of the downloaded files, in
order.
*/

use {
    crate::{
        archive::{ArchiveExtractor, ArchiveFormat},
        builder::{DirectoryBuilder, FilesystemCapabilities},
        cancel::CancellationToken,
        clone::{clone_file, CloneDirectory},
        error::{Result, StoreError},
        flags::{self, FlagKind},
        manifest::ManifestDigest,
        path::{normalize_relative, resolve},
        store::ImplementationSource,
        walker::platform_has_native_attributes,
    },
    filetime::FileTime,
    log::debug,
    std::path::{Path, PathBuf},
};

/// Extract an archive.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArchiveStep {
    pub href: String,
    pub mime_type: Option<String>,
    /// Bytes to skip at the start of the file.
    pub start_offset: u64,
    /// Sub-directory of the working tree to extract into.
    pub destination: Option<String>,
    /// Sub-directory of the archive to extract.
    pub extract: Option<String>,
}

/// Place a single downloaded file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SingleFileStep {
    pub href: String,
    pub destination: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoveStep {
    pub path: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RenameStep {
    pub source: String,
    pub destination: String,
}

/// Copy content out of another implementation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CopyFromStep {
    /// Id of the referenced implementation within its feed.
    pub id: String,
    /// Digest of the referenced implementation, once resolved.
    pub implementation: Option<ManifestDigest>,
    pub source: Option<String>,
    pub destination: Option<String>,
}

/// A recipe step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    Archive(ArchiveStep),
    SingleFile(SingleFileStep),
    Remove(RemoveStep),
    Rename(RenameStep),
    CopyFrom(CopyFromStep),
    /// A step type this implementation does not understand.
    Unknown(String),
}

impl Step {
    /// Whether the step consumes a downloaded file.
    pub fn needs_download(&self) -> bool {
        matches!(self, Self::Archive(_) | Self::SingleFile(_))
    }

    fn describe(&self) -> String {
        match self {
            Self::Archive(s) => format!("archive {}", s.href),
            Self::SingleFile(s) => format!("file {}", s.href),
            Self::Remove(s) => format!("remove {}", s.path),
            Self::Rename(s) => format!("rename {} to {}", s.source, s.destination),
            Self::CopyFrom(s) => format!("copy-from {}", s.id),
            Self::Unknown(name) => name.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Recipe {
    pub steps: Vec<Step>,
}

impl Recipe {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Number of downloaded files the recipe consumes.
    pub fn download_count(&self) -> usize {
        self.steps.iter().filter(|s| s.needs_download()).count()
    }
}

/// Services available while applying a recipe.
pub struct RecipeContext<'a> {
    pub cancel: CancellationToken,
    /// Resolves implementations referenced by copy-from steps.
    pub implementations: &'a dyn ImplementationSource,
}

/// Apply a recipe in a new temporary directory.
///
/// The returned directory is deleted when dropped. On error it is deleted
/// immediately.
pub fn apply(
    recipe: &Recipe,
    downloaded_files: &[PathBuf],
    context: &RecipeContext,
) -> Result<tempfile::TempDir> {
    let working = tempfile::Builder::new().prefix("0install-recipe").tempdir()?;
    let capabilities = FilesystemCapabilities::detect(working.path())?;

    apply_to(recipe, downloaded_files, context, working, capabilities)
}

/// Apply a recipe in a new temporary directory below `parent`.
pub fn apply_in(
    recipe: &Recipe,
    downloaded_files: &[PathBuf],
    context: &RecipeContext,
    parent: &Path,
) -> Result<tempfile::TempDir> {
    let working = tempfile::Builder::new()
        .prefix("0install-recipe")
        .tempdir_in(parent)?;
    let capabilities = FilesystemCapabilities::detect(working.path())?;

    apply_to(recipe, downloaded_files, context, working, capabilities)
}

/// Apply a recipe to an empty working directory with known filesystem capabilities.
pub fn apply_to(
    recipe: &Recipe,
    downloaded_files: &[PathBuf],
    context: &RecipeContext,
    working: tempfile::TempDir,
    capabilities: FilesystemCapabilities,
) -> Result<tempfile::TempDir> {
    if let Some(Step::Unknown(name)) = recipe.steps.iter().find(|s| matches!(s, Step::Unknown(_))) {
        return Err(StoreError::UnknownRecipeStep(name.clone()));
    }

    let mut downloaded = downloaded_files.iter();
    let mut applier = StepApplier {
        working: working.path(),
        capabilities,
        context,
    };

    for step in &recipe.steps {
        context.cancel.check()?;
        debug!("applying recipe step {}", step.describe());

        match step {
            Step::Archive(archive) => {
                let file = downloaded
                    .next()
                    .ok_or_else(|| StoreError::RecipeFileNotDownloaded(step.describe()))?;
                applier.archive(archive, file)?;
            }
            Step::SingleFile(single) => {
                let file = downloaded
                    .next()
                    .ok_or_else(|| StoreError::RecipeFileNotDownloaded(step.describe()))?;
                applier.single_file(single, file)?;
            }
            Step::Remove(remove) => applier.remove(remove)?,
            Step::Rename(rename) => applier.rename(rename)?,
            Step::CopyFrom(copy) => applier.copy_from(copy)?,
            Step::Unknown(name) => return Err(StoreError::UnknownRecipeStep(name.clone())),
        }
    }

    Ok(working)
}

struct StepApplier<'a, 'b> {
    working: &'a Path,
    capabilities: FilesystemCapabilities,
    context: &'a RecipeContext<'b>,
}

impl<'a, 'b> StepApplier<'a, 'b> {
    fn builder(&self, suffix: &str) -> Result<DirectoryBuilder> {
        let mut builder = DirectoryBuilder::with_capabilities(self.working, self.capabilities);
        builder.set_target_suffix(suffix)?;
        Ok(builder)
    }

    fn non_empty(path: &str) -> Result<String> {
        let normalized = normalize_relative(path)?;
        if normalized.is_empty() {
            Err(StoreError::PathBreakout(path.to_string()))
        } else {
            Ok(normalized)
        }
    }

    fn archive(&mut self, step: &ArchiveStep, file: &Path) -> Result<()> {
        let destination = normalize_relative(step.destination.as_deref().unwrap_or_default())?;

        let mime_type = step
            .mime_type
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| StoreError::UnknownArchiveType(step.href.clone()))?;
        let format = ArchiveFormat::from_mime_type(mime_type)?;

        let mut builder = self.builder(&destination)?;
        let mut extractor = ArchiveExtractor::new(&mut builder, &self.context.cancel);
        if let Some(extract) = &step.extract {
            extractor.set_extract(extract)?;
        }

        extractor.extract(file, format, step.start_offset)
    }

    fn single_file(&mut self, step: &SingleFileStep, file: &Path) -> Result<()> {
        if step.destination.is_empty() {
            return Err(StoreError::FileMissingDestination(step.href.clone()));
        }
        let destination = Self::non_empty(&step.destination)?;
        let path = resolve(self.working, &destination)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::symlink_metadata(&path).is_ok() {
            std::fs::remove_file(&path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?;
        }
        std::fs::copy(file, &path)
            .map_err(|e| StoreError::IoPath(format!("{}", file.display()), e))?;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(0, 0))?;

        flags::remove(FlagKind::Executable, self.working, &destination)?;
        flags::remove(FlagKind::Symlink, self.working, &destination)?;

        Ok(())
    }

    fn remove(&mut self, step: &RemoveStep) -> Result<()> {
        let relative = Self::non_empty(&step.path)?;
        let path = resolve(self.working, &relative)?;

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => remove_dir_all::remove_dir_all(&path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?,
            Ok(_) => std::fs::remove_file(&path)
                .map_err(|e| StoreError::IoPath(format!("{}", path.display()), e))?,
            Err(_) => {}
        }

        flags::remove(FlagKind::Executable, self.working, &relative)?;
        flags::remove(FlagKind::Symlink, self.working, &relative)?;

        Ok(())
    }

    fn rename(&mut self, step: &RenameStep) -> Result<()> {
        let source = Self::non_empty(&step.source)?;
        let destination = Self::non_empty(&step.destination)?;
        let source_path = resolve(self.working, &source)?;
        let destination_path = resolve(self.working, &destination)?;

        if let Some(parent) = destination_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&source_path, &destination_path)
            .map_err(|e| StoreError::IoPath(format!("{}", source_path.display()), e))?;

        flags::rename(FlagKind::Executable, self.working, &source, &destination)?;
        flags::rename(FlagKind::Symlink, self.working, &source, &destination)?;

        Ok(())
    }

    fn copy_from(&mut self, step: &CopyFromStep) -> Result<()> {
        let source = normalize_relative(step.source.as_deref().unwrap_or_default())?;
        let destination = normalize_relative(step.destination.as_deref().unwrap_or_default())?;

        let digest = step.implementation.as_ref().ok_or(StoreError::NotResolved)?;
        let implementation_path = self
            .context
            .implementations
            .implementation_path(digest)
            .ok_or_else(|| StoreError::ImplementationNotFound(digest.to_string()))?;
        let source_path = resolve(&implementation_path, &source)?;

        let metadata = std::fs::symlink_metadata(&source_path);
        match metadata {
            Ok(m) if m.is_dir() => {
                let builder = self.builder(&destination)?;
                CloneDirectory::new(&source_path, builder)
                    .use_hardlinks(true)
                    .run(&self.context.cancel)
            }
            Ok(_) => {
                if destination.is_empty() {
                    return Err(StoreError::CopyFromDestinationMissing(source));
                }
                let mut builder = self.builder("")?;
                clone_file(
                    &source_path,
                    &mut builder,
                    &destination,
                    true,
                    platform_has_native_attributes(),
                )
            }
            Err(_) => Err(StoreError::CopyFromSourceMissing(
                source,
                digest.to_string(),
            )),
        }
    }
}
