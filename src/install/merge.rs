//! Merge an extracted package payload into its installed directory.

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::runtime::{Runtime, is_path_under, relative_path};

/// Suffix of the companion metadata file the editor keeps next to every asset.
pub const META_SUFFIX: &str = ".meta";

const COPY_TMP_SUFFIX: &str = ".pkgrepo-tmp";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub copied: usize,
    pub removed: usize,
}

/// Path of the companion metadata file for `path` (`a/b.cs` -> `a/b.cs.meta`).
pub fn companion_of(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// Relative paths of every regular file below `root`, sorted.
pub fn collect_files<R: Runtime + ?Sized>(runtime: &R, root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    if !runtime.exists(root) {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in runtime
            .read_dir(&dir)
            .with_context(|| format!("Failed to list {:?}", dir))?
        {
            if runtime.is_dir(&entry) {
                pending.push(entry);
            } else if let Some(rel) = relative_path(&entry, root) {
                files.insert(rel);
            }
        }
    }
    Ok(files)
}

/// Make `target_dir` hold exactly the files of `source_root`.
///
/// Installed files missing from the new payload are deleted together with
/// their companion metadata; every payload file is then copied over its
/// installed counterpart through a temporary sibling and a rename.
#[tracing::instrument(skip(runtime))]
pub fn merge_package<R: Runtime + ?Sized>(
    runtime: &R,
    source_root: &Path,
    target_dir: &Path,
) -> Result<MergeReport> {
    if runtime.exists(target_dir) && !runtime.is_dir(target_dir) {
        bail!("{:?} exists and is not a directory", target_dir);
    }

    let incoming = collect_files(runtime, source_root)?;
    let installed = collect_files(runtime, target_dir)?;
    let mut report = MergeReport::default();

    let stale: Vec<&PathBuf> = installed.difference(&incoming).collect();
    let mut touched_dirs = BTreeSet::new();
    for rel in stale {
        for path in [target_dir.join(rel), target_dir.join(companion_of(rel))] {
            if !runtime.exists(&path) || runtime.is_dir(&path) {
                continue;
            }
            debug!("Removing stale file {:?}", path);
            runtime
                .remove_file(&path)
                .with_context(|| format!("Failed to remove stale file {:?}", path))?;
            report.removed += 1;
        }
        if let Some(parent) = rel.parent().filter(|p| !p.as_os_str().is_empty()) {
            touched_dirs.insert(parent.to_path_buf());
        }
    }
    prune_empty_dirs(runtime, target_dir, touched_dirs);

    for rel in &incoming {
        let src = source_root.join(rel);
        let dest = target_dir.join(rel);
        if !is_path_under(&dest, target_dir) {
            bail!("Refusing to write {:?} outside {:?}", dest, target_dir);
        }
        copy_atomic(runtime, &src, &dest)?;
        report.copied += 1;
    }

    debug!(
        "Merged {:?} into {:?}: {} copied, {} removed",
        source_root, target_dir, report.copied, report.removed
    );
    Ok(report)
}

/// Copy `src` to a temporary sibling of `dest`, then rename it into place.
fn copy_atomic<R: Runtime + ?Sized>(runtime: &R, src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        runtime
            .create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut tmp_name = OsString::from(".");
    tmp_name.push(dest.file_name().unwrap_or_default());
    tmp_name.push(COPY_TMP_SUFFIX);
    let tmp = dest.with_file_name(tmp_name);

    let result = runtime
        .copy(src, &tmp)
        .with_context(|| format!("Failed to copy {:?} to {:?}", src, tmp))
        .and_then(|_| {
            runtime
                .rename(&tmp, dest)
                .with_context(|| format!("Failed to move {:?} into place", dest))
        });
    if result.is_err() && runtime.exists(&tmp) {
        let _ = runtime.remove_file(&tmp);
    }
    result
}

/// Remove directories below `root` left empty by stale file removal, deepest first.
fn prune_empty_dirs<R: Runtime + ?Sized>(runtime: &R, root: &Path, dirs: BTreeSet<PathBuf>) {
    let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
    for dir in dirs {
        let mut current = Some(dir.as_path());
        while let Some(rel) = current.filter(|p| !p.as_os_str().is_empty()) {
            candidates.insert(rel.to_path_buf());
            current = rel.parent();
        }
    }

    let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for rel in ordered {
        let path = root.join(&rel);
        let empty = runtime
            .read_dir(&path)
            .map(|entries| entries.is_empty())
            .unwrap_or(false);
        if !empty {
            continue;
        }
        if let Err(e) = runtime.remove_dir(&path) {
            warn!("Failed to remove empty directory {:?}: {}", path, e);
            continue;
        }
        let companion = root.join(companion_of(&rel));
        if runtime.exists(&companion) && !runtime.is_dir(&companion) {
            let _ = runtime.remove_file(&companion);
        }
    }
}
