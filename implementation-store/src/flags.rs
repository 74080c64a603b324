// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Flag files.

Some filesystems cannot record that a file is executable or that it is a
symlink. For those, the attribute is recorded in a sidecar text file at the
root of the tree. Each line holds one `/`-rooted path relative to the
directory containing the flag file:

```text
/bin/app
/lib/helper
```

The executable flag file is named `.xbit` and the symlink flag file is named
`.symlink`.
*/

use {
    crate::{
        error::{Result, StoreError},
        path::normalize_relative,
    },
    std::{
        collections::BTreeSet,
        io::Write,
        path::{Path, PathBuf},
    },
};

/// The attribute a flag file records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::EnumIter)]
pub enum FlagKind {
    Executable,
    Symlink,
}

impl FlagKind {
    /// The file name of the flag file for this attribute.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Executable => ".xbit",
            Self::Symlink => ".symlink",
        }
    }

    /// Whether a file name is one of the flag files.
    pub fn is_flag_file(name: &str) -> bool {
        <Self as strum::IntoEnumIterator>::iter().any(|kind| kind.file_name() == name)
    }
}

fn read_lines(flag_file: &Path) -> Result<Option<Vec<String>>> {
    match std::fs::read_to_string(flag_file) {
        Ok(data) => Ok(Some(
            data.lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.to_string())
                .collect(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::IoPath(format!("{}", flag_file.display()), e)),
    }
}

fn write_lines(flag_file: &Path, lines: &[String]) -> Result<()> {
    let directory = flag_file.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    for line in lines {
        writeln!(temp, "{}", line)?;
    }
    temp.persist(flag_file)?;

    Ok(())
}

fn flag_line(relative: &str) -> Result<String> {
    Ok(format!("/{}", normalize_relative(relative)?))
}

/// Obtain the absolute paths of all entries flagged with an attribute.
///
/// The flag file is searched for in `directory` and then in each of its
/// ancestors, since a tree's flag file lives at the tree root and applies to
/// every subdirectory.
pub fn flagged_paths(kind: FlagKind, directory: &Path) -> Result<BTreeSet<PathBuf>> {
    for candidate in directory.ancestors() {
        let flag_file = candidate.join(kind.file_name());

        if let Some(lines) = read_lines(&flag_file)? {
            return Ok(lines
                .iter()
                .map(|line| {
                    let mut path = candidate.to_path_buf();
                    for component in line.split('/').filter(|c| !c.is_empty()) {
                        path.push(component);
                    }
                    path
                })
                .collect());
        }
    }

    Ok(BTreeSet::new())
}

/// Flag a path relative to `directory`.
pub fn set(kind: FlagKind, directory: &Path, relative: &str) -> Result<()> {
    let flag_file = directory.join(kind.file_name());
    let line = flag_line(relative)?;

    if read_lines(&flag_file)?.map_or(false, |lines| lines.contains(&line)) {
        return Ok(());
    }

    let mut fh = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&flag_file)
        .map_err(|e| StoreError::IoPath(format!("{}", flag_file.display()), e))?;
    writeln!(fh, "{}", line)?;

    Ok(())
}

/// Remove the flag from a path and everything below it.
pub fn remove(kind: FlagKind, directory: &Path, relative: &str) -> Result<()> {
    let flag_file = directory.join(kind.file_name());
    let Some(lines) = read_lines(&flag_file)? else {
        return Ok(());
    };

    let line = flag_line(relative)?;
    let prefix = format!("{}/", line);

    let retained = lines
        .iter()
        .filter(|l| **l != line && !l.starts_with(&prefix))
        .cloned()
        .collect::<Vec<_>>();

    if retained.len() != lines.len() {
        write_lines(&flag_file, &retained)?;
    }

    Ok(())
}

/// Move the flags of a path and everything below it to a new location.
pub fn rename(kind: FlagKind, directory: &Path, source: &str, destination: &str) -> Result<()> {
    let flag_file = directory.join(kind.file_name());
    let Some(lines) = read_lines(&flag_file)? else {
        return Ok(());
    };

    let source = flag_line(source)?;
    let destination = flag_line(destination)?;
    let prefix = format!("{}/", source);

    let mut changed = false;
    let mut seen = BTreeSet::new();
    let renamed = lines
        .into_iter()
        .map(|l| {
            if l == source {
                changed = true;
                destination.clone()
            } else if let Some(rest) = l.strip_prefix(&prefix) {
                changed = true;
                format!("{}/{}", destination, rest)
            } else {
                l
            }
        })
        .filter(|l| seen.insert(l.clone()))
        .collect::<Vec<_>>();

    if changed {
        write_lines(&flag_file, &renamed)?;
    }

    Ok(())
}
