//! Path utility functions for normalization, containment and file naming.

use std::path::{Component, Path, PathBuf};

/// Characters that are rejected in file names on at least one supported platform.
const INVALID_FILE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Normalize a path by processing `.` and `..` components lexically.
/// This does not access the filesystem and does not follow symlinks.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(component);
                }
            }
            _ => result.push(component),
        }
    }
    result
}

/// Check if a path is under a given directory by comparing normalized path components.
///
/// `/proj/Packages/a/../../../etc/passwd` is NOT under `/proj/Packages`.
pub fn is_path_under(path: &Path, dir: &Path) -> bool {
    let normalized_path = normalize_path(path);
    let normalized_dir = normalize_path(dir);

    let path_components: Vec<_> = normalized_path.components().collect();
    let dir_components: Vec<_> = normalized_dir.components().collect();

    if path_components.len() < dir_components.len() {
        return false;
    }

    dir_components
        .iter()
        .zip(path_components.iter())
        .all(|(d, p)| d == p)
}

/// Path of `path` relative to `base`, or `None` when `path` is not inside `base`.
///
/// `relative_path("/pkg/Runtime/a.cs", "/pkg")` is `Runtime/a.cs`.
pub fn relative_path(path: &Path, base: &Path) -> Option<PathBuf> {
    let result = pathdiff::diff_paths(path, base)?;
    if result.is_absolute()
        || result.as_os_str().is_empty()
        || result
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(result)
}

/// Replace characters that are invalid in file names with `_`.
/// Spaces are preserved so display names survive the round trip.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if INVALID_FILE_NAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = sanitized.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
